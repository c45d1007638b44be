//! TOML settings loading and validation: device connection, datapoint list
//! location, and the optional InfluxDB and MQTT sinks.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub datapoints_file: String,
    pub device: DeviceSettings,
    #[serde(default)]
    pub influx: Option<InfluxSettings>,
    #[serde(default)]
    pub mqtt: Option<MqttSettings>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceSettings {
    pub url: String,
    #[serde(default = "default_device_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
}

#[derive(Debug, Deserialize)]
pub struct InfluxSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub url: String,
    #[serde(default)]
    pub token: String,
    pub org: String,
    pub bucket: String,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub client_id: String,
    pub base_topic: String,
    pub discovery_prefix: String,
    pub model: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 1883,
            user: String::new(),
            password: String::new(),
            client_id: "windhager-proxy".to_string(),
            base_topic: "windhager".to_string(),
            discovery_prefix: "homeassistant".to_string(),
            model: "BioWin2".to_string(),
        }
    }
}

fn default_device_user() -> String {
    "Service".to_string()
}

fn default_timeout_sec() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl DeviceSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }
}

impl InfluxSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }
}

impl Settings {
    /// The InfluxDB section, if present and enabled.
    pub fn influx(&self) -> Option<&InfluxSettings> {
        self.influx.as_ref().filter(|i| i.enabled)
    }

    /// The MQTT section, if present and enabled.
    pub fn mqtt(&self) -> Option<&MqttSettings> {
        self.mqtt.as_ref().filter(|m| m.enabled)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Settings {
    /// Validate all settings. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.datapoints_file.trim().is_empty() {
            errors.push("datapoints_file is empty".to_string());
        }

        if self.device.url.trim().is_empty() {
            errors.push("device.url is empty".to_string());
        }
        if self.device.timeout_sec == 0 {
            errors.push("device.timeout_sec must be positive".to_string());
        }

        if let Some(i) = self.influx() {
            Self::validate_influx(i, &mut errors);
        }
        if let Some(m) = self.mqtt() {
            Self::validate_mqtt(m, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_influx(i: &InfluxSettings, errors: &mut Vec<String>) {
        if i.url.trim().is_empty() {
            errors.push("influx.url is empty".to_string());
        }
        if i.org.trim().is_empty() {
            errors.push("influx.org is empty".to_string());
        }
        if i.bucket.trim().is_empty() {
            errors.push("influx.bucket is empty".to_string());
        }
        if i.timeout_sec == 0 {
            errors.push("influx.timeout_sec must be positive".to_string());
        }
    }

    fn validate_mqtt(m: &MqttSettings, errors: &mut Vec<String>) {
        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if m.port == 0 {
            errors.push("mqtt.port must be non-zero".to_string());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".to_string());
        }
        if m.base_topic.trim().is_empty() {
            errors.push("mqtt.base_topic is empty".to_string());
        } else if m.base_topic.contains(['#', '+']) {
            errors.push(format!(
                "mqtt.base_topic '{}' must not contain wildcards",
                m.base_topic
            ));
        }
        if m.discovery_prefix.trim().is_empty() {
            errors.push("mqtt.discovery_prefix is empty".to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML settings file.
pub fn load(path: &str) -> Result<Settings> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let settings: Settings =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    settings
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(settings)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
datapoints_file = "datapoints.csv"

[device]
url = "http://192.168.1.20"
user = "Service"
password = "123"

[influx]
url = "http://localhost:8086"
token = "secret"
org = "home"
bucket = "windhager"

[mqtt]
host = "broker"
user = "bridge"
password = "pw"
"#;

    fn parse(s: &str) -> Settings {
        toml::from_str(s).unwrap()
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Settings, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let cfg = parse(FULL);
        assert_eq!(cfg.datapoints_file, "datapoints.csv");
        assert_eq!(cfg.device.timeout_sec, 10);
        let influx = cfg.influx().unwrap();
        assert_eq!(influx.bucket, "windhager");
        let mqtt = cfg.mqtt().unwrap();
        assert_eq!(mqtt.host, "broker");
        assert_eq!(mqtt.port, 1883);
        assert_eq!(mqtt.base_topic, "windhager");
        assert_eq!(mqtt.discovery_prefix, "homeassistant");
        cfg.validate().unwrap();
    }

    #[test]
    fn parse_minimal_config_has_no_sinks() {
        let cfg = parse(
            r#"
datapoints_file = "dp.csv"
[device]
url = "http://boiler"
"#,
        );
        assert!(cfg.influx().is_none());
        assert!(cfg.mqtt().is_none());
        assert_eq!(cfg.device.user, "Service");
        cfg.validate().unwrap();
    }

    #[test]
    fn disabled_sections_are_ignored() {
        let mut cfg = parse(FULL);
        cfg.influx.as_mut().unwrap().enabled = false;
        cfg.mqtt.as_mut().unwrap().enabled = false;
        assert!(cfg.influx().is_none());
        assert!(cfg.mqtt().is_none());
    }

    #[test]
    fn missing_device_section_fails_to_parse() {
        assert!(toml::from_str::<Settings>(r#"datapoints_file = "x""#).is_err());
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn empty_device_url_rejected() {
        let mut cfg = parse(FULL);
        cfg.device.url = " ".into();
        assert_validation_err(&cfg, "device.url is empty");
    }

    #[test]
    fn empty_datapoints_file_rejected() {
        let mut cfg = parse(FULL);
        cfg.datapoints_file = "".into();
        assert_validation_err(&cfg, "datapoints_file is empty");
    }

    #[test]
    fn influx_bucket_required_when_enabled() {
        let mut cfg = parse(FULL);
        cfg.influx.as_mut().unwrap().bucket = "".into();
        assert_validation_err(&cfg, "influx.bucket is empty");
    }

    #[test]
    fn influx_errors_ignored_when_disabled() {
        let mut cfg = parse(FULL);
        let influx = cfg.influx.as_mut().unwrap();
        influx.bucket = "".into();
        influx.enabled = false;
        cfg.validate().unwrap();
    }

    #[test]
    fn mqtt_wildcard_base_topic_rejected() {
        let mut cfg = parse(FULL);
        cfg.mqtt.as_mut().unwrap().base_topic = "windhager/#".into();
        assert_validation_err(&cfg, "must not contain wildcards");
    }

    #[test]
    fn mqtt_zero_port_rejected() {
        let mut cfg = parse(FULL);
        cfg.mqtt.as_mut().unwrap().port = 0;
        assert_validation_err(&cfg, "mqtt.port must be non-zero");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = parse(FULL);
        cfg.device.url = "".into();
        cfg.influx.as_mut().unwrap().org = "".into();
        cfg.mqtt.as_mut().unwrap().host = "".into();
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
        assert!(msg.contains("device.url is empty"));
        assert!(msg.contains("influx.org is empty"));
        assert!(msg.contains("mqtt.host is empty"));
    }

    #[test]
    fn load_missing_file_fails() {
        let err = load("/nonexistent/config.toml").unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config"));
    }
}
