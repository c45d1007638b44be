//! Inbound write commands: `{"OID": "<address>", "value": <value>}` on the
//! command topic, validated and forwarded to the device.

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;

use crate::device::{DeviceClient, DeviceError};

/// Minimum number of `/`-separated segments in a writable address.
const MIN_ADDRESS_SEGMENTS: usize = 5;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("malformed JSON data: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("no {0} in data")]
    MissingField(&'static str),

    #[error("malformed OID '{0}'")]
    MalformedAddress(String),

    #[error("failed to get datapoint for OID {address}: {source}")]
    Read {
        address: String,
        source: DeviceError,
    },

    #[error("failed to set datapoint for OID {address} to {value}: {source}")]
    Write {
        address: String,
        value: String,
        source: DeviceError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub address: String,
    pub value: String,
}

impl CommandRequest {
    /// Validate a raw payload into a request.
    pub fn parse(payload: &[u8]) -> Result<Self, CommandError> {
        let data: JsonValue = serde_json::from_slice(payload)?;

        let address = match data.get("OID") {
            Some(JsonValue::String(s)) => s.clone(),
            _ => return Err(CommandError::MissingField("OID")),
        };
        let value = match data.get("value") {
            Some(JsonValue::String(s)) => s.clone(),
            Some(v @ (JsonValue::Number(_) | JsonValue::Bool(_))) => v.to_string(),
            _ => return Err(CommandError::MissingField("value")),
        };

        if address.split('/').count() < MIN_ADDRESS_SEGMENTS {
            return Err(CommandError::MalformedAddress(address));
        }

        Ok(Self { address, value })
    }
}

/// Apply one inbound command. The current value is read first and the write
/// is only attempted when that read succeeds.
pub async fn handle(device: &dyn DeviceClient, payload: &[u8]) -> Result<(), CommandError> {
    let req = CommandRequest::parse(payload)?;

    let old = device
        .read(&req.address)
        .await
        .map_err(|source| CommandError::Read {
            address: req.address.clone(),
            source,
        })?;
    let old_value = match old.value {
        Some(JsonValue::String(s)) => s,
        Some(other) => other.to_string(),
        None => String::new(),
    };
    info!(address = %req.address, "old value {old_value}");

    device
        .write(&req.address, &req.value)
        .await
        .map_err(|source| CommandError::Write {
            address: req.address.clone(),
            value: req.value.clone(),
            source,
        })?;

    info!(address = %req.address, "new value {}", req.value);
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
