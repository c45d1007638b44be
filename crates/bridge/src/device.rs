//! Device access: the read/write contract the pipeline relies on, and an
//! HTTP client for the controller's JSON datapoint API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("device returned status {status} for {address}")]
    Status {
        address: String,
        status: reqwest::StatusCode,
    },
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// One datapoint as reported by the device. Every field is optional on the
/// wire; bounds are kept as raw JSON so only true numbers count as bounds.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Reading {
    #[serde(default)]
    pub value: Option<JsonValue>,
    #[serde(rename = "minValue", default)]
    pub min_value: Option<JsonValue>,
    #[serde(rename = "maxValue", default)]
    pub max_value: Option<JsonValue>,
}

/// Must be safe to call from the poll loop and the command listener at the
/// same time.
#[async_trait]
pub trait DeviceClient: Send + Sync {
    async fn read(&self, address: &str) -> DeviceResult<Reading>;
    async fn write(&self, address: &str, value: &str) -> DeviceResult<()>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct WriteBody<'a> {
    #[serde(rename = "OID")]
    oid: &'a str,
    value: &'a str,
}

pub struct HttpDeviceClient {
    base_url: String,
    user: String,
    password: String,
    http: reqwest::Client,
}

impl HttpDeviceClient {
    pub fn new(base_url: &str, user: &str, password: &str, timeout: Duration) -> DeviceResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            user: user.to_string(),
            password: password.to_string(),
            http,
        })
    }

    fn datapoint_url(&self, address: &str) -> String {
        format!("{}/api/1.0/datapoint{}", self.base_url, address)
    }
}

#[async_trait]
impl DeviceClient for HttpDeviceClient {
    async fn read(&self, address: &str) -> DeviceResult<Reading> {
        let response = self
            .http
            .get(self.datapoint_url(address))
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DeviceError::Status {
                address: address.to_string(),
                status: response.status(),
            });
        }

        Ok(response.json::<Reading>().await?)
    }

    async fn write(&self, address: &str, value: &str) -> DeviceResult<()> {
        let response = self
            .http
            .put(self.datapoint_url(""))
            .basic_auth(&self.user, Some(&self.password))
            .json(&WriteBody { oid: address, value })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DeviceError::Status {
                address: address.to_string(),
                status: response.status(),
            });
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
