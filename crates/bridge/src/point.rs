//! Typed datapoint values and coercion of raw device readings.

use serde::Serialize;
use serde_json::Value as JsonValue;
use std::fmt;

use crate::device::Reading;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

/// One coerced datapoint of a poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub address: String,
    pub key: String,
    pub label: String,
    pub value: Value,
}

/// Result of coercing a reading. `fallback` is set when the value could not
/// be interpreted numerically and was kept as text.
#[derive(Debug, PartialEq)]
pub struct Coerced {
    pub value: Value,
    pub fallback: bool,
}

/// Coerce a raw device value. Readings bounded exactly by 0 and 1 are
/// two-state and become integers; other numeric values become floats;
/// anything else is kept as text. Returns `None` if the reading has no value.
pub fn coerce(reading: &Reading) -> Option<Coerced> {
    let raw = reading.value.as_ref()?;

    let parsed = if is_two_state(reading) {
        as_integer(raw).map(Value::Integer)
    } else {
        as_float(raw).map(Value::Float)
    };

    Some(match parsed {
        Some(value) => Coerced {
            value,
            fallback: false,
        },
        None => Coerced {
            value: Value::Text(raw_text(raw)),
            fallback: true,
        },
    })
}

fn is_two_state(reading: &Reading) -> bool {
    let bound = |v: &Option<JsonValue>| v.as_ref().and_then(JsonValue::as_f64);
    bound(&reading.min_value) == Some(0.0) && bound(&reading.max_value) == Some(1.0)
}

fn as_float(raw: &JsonValue) -> Option<f64> {
    match raw {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

fn as_integer(raw: &JsonValue) -> Option<i64> {
    if let JsonValue::Number(n) = raw {
        if let Some(i) = n.as_i64() {
            return Some(i);
        }
    }
    if let JsonValue::String(s) = raw {
        if let Ok(i) = s.trim().parse::<i64>() {
            return Some(i);
        }
    }
    // Integral decimals such as "1.0".
    as_float(raw)
        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
        .map(|f| f as i64)
}

fn raw_text(raw: &JsonValue) -> String {
    match raw {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
