//! Datapoint registry: the fixed set of device addresses polled each cycle,
//! loaded once from a comma-separated text file.
//!
//! ```text
//! # address, key, display text, reserved, unit-or-kind
//! /1/60/0/0/1, 0-0, Aussentemperatur,, °C
//! /1/15/0/3/2, 3-2, Betriebsphasen,, State
//! ```

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use tracing::debug;

use crate::mqtt::normalize;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Enumerated state datapoints the discovery templates know how to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enumeration {
    /// Burner operating phase, codes 0-17.
    OperatingPhase,
    /// Selected operating mode, codes 0-6.
    OperatingMode,
}

impl Enumeration {
    /// Resolve from a normalized label.
    fn from_label(label: &str) -> Option<Self> {
        match label {
            "betriebsphasen" => Some(Self::OperatingPhase),
            "betriebswahl" => Some(Self::OperatingMode),
            _ => None,
        }
    }

    /// Code → human label pairs.
    pub fn labels(self) -> &'static [(i64, &'static str)] {
        match self {
            Self::OperatingPhase => &[
                (0, "Brenner gesperrt"),
                (1, "Selbsttest"),
                (2, "WE ausschalten"),
                (3, "Standby"),
                (4, "Brenner AUS"),
                (5, "Vorspülen"),
                (6, "Zündphase"),
                (7, "Flammenstabilisierung"),
                (8, "Modulationsbetrieb"),
                (9, "Kessel gesperrt"),
                (10, "Standby Sperrzeit"),
                (11, "Gebläse AUS"),
                (12, "Verkleidungstür offen"),
                (13, "Zündung bereit"),
                (14, "Abbruch Zündphase"),
                (15, "Anheizvorgang"),
                (16, "Schichtladung"),
                (17, "Ausbrand"),
            ],
            Self::OperatingMode => &[
                (0, "Standby"),
                (1, "Heizprogramm 1"),
                (2, "Heizprogramm 2"),
                (3, "Heizprogramm 3"),
                (4, "Heizbetrieb"),
                (5, "Absenkbetrieb"),
                (6, "Warmwasserbetrieb"),
            ],
        }
    }
}

/// How a datapoint is rendered downstream, resolved from the unit-or-kind
/// column at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatapointKind {
    Binary,
    /// `None` when the label matches no known enumeration.
    EnumeratedState { enumeration: Option<Enumeration> },
    PlainUnit { unit: Option<String> },
}

impl DatapointKind {
    fn resolve(unit_or_kind: Option<&str>, label: &str) -> Self {
        match unit_or_kind {
            Some(s) if s.eq_ignore_ascii_case("binary") => Self::Binary,
            Some(s) if s.eq_ignore_ascii_case("state") => Self::EnumeratedState {
                enumeration: Enumeration::from_label(&normalize(label)),
            },
            other => Self::PlainUnit {
                unit: other.map(str::to_string),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatapointMeta {
    /// Group/member identifier, e.g. `12-34`.
    pub key: String,
    pub text: Option<String>,
    pub kind: DatapointKind,
}

impl DatapointMeta {
    /// Label used for measurement and field names: display text without
    /// periods, spaces replaced by underscores.
    pub fn label(&self) -> String {
        match &self.text {
            Some(t) => point_label(t),
            None => "unknown".to_string(),
        }
    }
}

fn point_label(text: &str) -> String {
    text.replace('.', "").replace(' ', "_")
}

/// Immutable address → metadata mapping, iterated in address order.
#[derive(Debug, Clone, Default)]
pub struct AddressRegistry {
    entries: BTreeMap<String, DatapointMeta>,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl AddressRegistry {
    /// Read and parse the datapoint list. A missing file is an error; bad
    /// lines are skipped.
    pub fn load(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read datapoint list: {path}"))?;
        Ok(Self::parse(&contents))
    }

    pub fn parse(contents: &str) -> Self {
        let mut entries = BTreeMap::new();

        for (n, raw) in contents.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 2 {
                debug!(line = n + 1, "datapoint list: too few fields, skipping");
                continue;
            }

            let (address, key) = (fields[0], fields[1]);
            if address.is_empty() || key.is_empty() {
                debug!(line = n + 1, "datapoint list: empty address or key, skipping");
                continue;
            }

            let text = non_empty(fields.get(2));
            let unit_or_kind = non_empty(fields.get(4));
            let label = text.map(point_label).unwrap_or_default();

            entries.insert(
                address.to_string(),
                DatapointMeta {
                    key: key.to_string(),
                    text: text.map(str::to_string),
                    kind: DatapointKind::resolve(unit_or_kind, &label),
                },
            );
        }

        Self { entries }
    }

    #[cfg(test)]
    pub fn get(&self, address: &str) -> Option<&DatapointMeta> {
        self.entries.get(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DatapointMeta)> {
        self.entries.iter().map(|(a, m)| (a.as_str(), m))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn non_empty<'a>(field: Option<&&'a str>) -> Option<&'a str> {
    field.copied().filter(|s| !s.is_empty())
}

// ===========================================================================
// Tests
// ===========================================================================
