//! MQTT sink: aggregated state message every cycle, Home Assistant discovery
//! configs when the scheduler asks for them, and the connection event loop
//! that carries liveness and inbound write commands.

use async_trait::async_trait;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::command;
use crate::config::MqttSettings;
use crate::device::DeviceClient;
use crate::point::Point;
use crate::registry::{AddressRegistry, DatapointKind, DatapointMeta, Enumeration};
use crate::sink::{Sink, SinkError, SinkResult};

/// Upper bound for handing a publish to the client's request queue.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

const ONLINE: &str = "online";
const OFFLINE: &str = "offline";

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Topics {
    pub base: String,
    pub discovery_prefix: String,
    pub model: String,
}

impl Topics {
    pub fn from_settings(s: &MqttSettings) -> Self {
        Self {
            base: s.base_topic.clone(),
            discovery_prefix: s.discovery_prefix.clone(),
            model: s.model.clone(),
        }
    }

    pub fn state(&self) -> String {
        format!("{}/state", self.base)
    }

    pub fn lwt(&self) -> String {
        format!("{}/lwt", self.base)
    }

    pub fn command(&self) -> String {
        format!("{}/put/datapoint", self.base)
    }

    fn discovery(&self, component: &str, object_id: &str) -> String {
        format!("{}/{component}/{object_id}/config", self.discovery_prefix)
    }
}

// ---------------------------------------------------------------------------
// Name normalization
// ---------------------------------------------------------------------------

/// Lowercase, drop periods, hyphens to underscores, German umlauts and sharp
/// s to ASCII digraphs. MQTT topic separators and wildcards become
/// underscores and quotes are dropped, so the result is safe inside a topic
/// level and a Jinja string literal. Idempotent.
pub fn normalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.to_lowercase().chars() {
        match c {
            '.' | '\'' | '"' | '\\' => {}
            '-' | '/' | '+' | '#' => out.push('_'),
            'ä' => out.push_str("ae"),
            'ö' => out.push_str("oe"),
            'ü' => out.push_str("ue"),
            'ß' => out.push_str("ss"),
            c => out.push(c),
        }
    }
    out
}

/// Field name of a datapoint inside the state message.
pub fn field_name(label: &str, key: &str) -> String {
    format!("{}_{}", normalize(label), normalize(key))
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

pub(crate) fn state_payload(points: &[Point]) -> Map<String, JsonValue> {
    points
        .iter()
        .map(|p| {
            let value = serde_json::to_value(&p.value).unwrap_or(JsonValue::Null);
            (field_name(&p.label, &p.key), value)
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub(crate) struct DeviceDescriptor {
    pub identifiers: Vec<String>,
    pub name: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub(crate) struct DiscoveryConfig {
    #[serde(rename = "~")]
    pub base: String,
    pub name: String,
    pub unique_id: String,
    pub device: DeviceDescriptor,
    pub state_topic: String,
    pub value_template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_on: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_off: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DiscoveryMessage {
    pub topic: String,
    pub config: DiscoveryConfig,
}

/// Build the discovery config for one datapoint. Returns `None` for state
/// datapoints without a known code table.
pub(crate) fn discovery_message(topics: &Topics, meta: &DatapointMeta) -> Option<DiscoveryMessage> {
    let label = meta.label();
    let field = field_name(&label, &meta.key);
    let object_id = format!("{}_{field}", normalize(&topics.base));

    let mut config = DiscoveryConfig {
        base: topics.base.clone(),
        name: meta.text.clone().unwrap_or(label),
        unique_id: object_id.clone(),
        device: DeviceDescriptor {
            identifiers: vec![topics.base.clone()],
            name: "Windhager".to_string(),
            model: topics.model.clone(),
        },
        state_topic: "~/state".to_string(),
        value_template: format!("{{{{ value_json['{field}'] }}}}"),
        device_class: None,
        payload_on: None,
        payload_off: None,
        unit_of_measurement: None,
    };

    let component = match &meta.kind {
        DatapointKind::Binary => {
            // Render as float so the payload matches "1.0"/"0.0".
            config.value_template = format!("{{{{ value_json['{field}'] | float }}}}");
            config.device_class = Some("power".to_string());
            config.payload_on = Some("1.0".to_string());
            config.payload_off = Some("0.0".to_string());
            "binary_sensor"
        }
        DatapointKind::EnumeratedState {
            enumeration: Some(enumeration),
        } => {
            config.value_template = enum_template(&field, *enumeration);
            "sensor"
        }
        DatapointKind::EnumeratedState { enumeration: None } => return None,
        DatapointKind::PlainUnit { unit } => {
            config.unit_of_measurement = unit.clone();
            "sensor"
        }
    };

    Some(DiscoveryMessage {
        topic: topics.discovery(component, &object_id),
        config,
    })
}

fn enum_template(field: &str, enumeration: Enumeration) -> String {
    let mapper = enumeration
        .labels()
        .iter()
        .map(|(code, text)| format!("{code}: '{text}'"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{{% set mapper = {{{mapper}}} %}}\
         {{% set state = value_json['{field}'] | int %}}\
         {{{{ mapper[state] if state in mapper else 'Unknown' }}}}"
    )
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// The part of the MQTT client the sink and the event loop use.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Queue a QoS 1 publish, waiting for room in the request channel.
    async fn publish_to(&self, topic: String, retain: bool, payload: Vec<u8>) -> SinkResult<()>;

    /// Queue a QoS 1 publish without waiting. The event loop must never block
    /// on its own request channel.
    fn try_publish_to(&self, topic: String, retain: bool, payload: Vec<u8>)
        -> Result<(), ClientError>;

    fn try_subscribe_to(&self, topic: String) -> Result<(), ClientError>;
}

#[async_trait]
impl Publisher for AsyncClient {
    async fn publish_to(&self, topic: String, retain: bool, payload: Vec<u8>) -> SinkResult<()> {
        timeout(
            PUBLISH_TIMEOUT,
            self.publish(topic, QoS::AtLeastOnce, retain, payload),
        )
        .await
        .map_err(|_| SinkError::Timeout)??;
        Ok(())
    }

    fn try_publish_to(
        &self,
        topic: String,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), ClientError> {
        self.try_publish(topic, QoS::AtLeastOnce, retain, payload)
    }

    fn try_subscribe_to(&self, topic: String) -> Result<(), ClientError> {
        self.try_subscribe(topic, QoS::AtLeastOnce)
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

pub struct MqttSink<P = AsyncClient> {
    client: P,
    topics: Topics,
}

impl<P: Publisher> MqttSink<P> {
    pub fn new(client: P, topics: Topics) -> Self {
        Self { client, topics }
    }
}

#[async_trait]
impl<P: Publisher> Sink for MqttSink<P> {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn write_points(&self, points: &[Point], _timestamp: i64) -> SinkResult<()> {
        if points.is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_vec(&state_payload(points))?;
        self.client
            .publish_to(self.topics.state(), false, payload)
            .await
    }

    async fn announce(&self, registry: &AddressRegistry) -> SinkResult<()> {
        info!(datapoints = registry.len(), "publishing discovery data");

        let mut total = 0;
        let mut failed = 0;

        for (address, meta) in registry.iter() {
            let Some(msg) = discovery_message(&self.topics, meta) else {
                warn!(address, key = %meta.key, text = ?meta.text, "unknown state variable, no discovery published");
                continue;
            };
            total += 1;

            let result = match serde_json::to_vec(&msg.config) {
                Ok(payload) => self.client.publish_to(msg.topic.clone(), true, payload).await,
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(()) => debug!(topic = %msg.topic, "discovery published"),
                Err(e) => {
                    warn!(topic = %msg.topic, "discovery publish failed: {e}");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(SinkError::Discovery { failed, total });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

pub fn options(s: &MqttSettings, topics: &Topics) -> MqttOptions {
    let mut opts = MqttOptions::new(&s.client_id, &s.host, s.port);
    opts.set_keep_alive(Duration::from_secs(60));
    opts.set_last_will(LastWill::new(topics.lwt(), OFFLINE, QoS::AtLeastOnce, true));
    if !s.user.is_empty() {
        opts.set_credentials(&s.user, &s.password);
    }
    opts
}

/// Drive the MQTT connection forever.
pub async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: Topics,
    device: Arc<dyn DeviceClient>,
) {
    loop {
        match eventloop.poll().await {
            Ok(event) => {
                handle_event(&event, &client, &topics, &device);
            }
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

/// React to one connection event: announce liveness and subscribe on every
/// (re)connect, and hand inbound write commands to the device. Returns the
/// task applying a command, if one was started.
pub(crate) fn handle_event<P: Publisher>(
    event: &Event,
    client: &P,
    topics: &Topics,
    device: &Arc<dyn DeviceClient>,
) -> Option<JoinHandle<()>> {
    match event {
        Event::Incoming(Packet::ConnAck(_)) => {
            info!("connected to MQTT broker");
            if let Err(e) = client.try_publish_to(topics.lwt(), true, ONLINE.as_bytes().to_vec()) {
                warn!("failed to publish online state: {e}");
            }
            let command_topic = topics.command();
            if let Err(e) = client.try_subscribe_to(command_topic.clone()) {
                error!(topic = %command_topic, "failed to subscribe: {e}");
            }
            None
        }
        Event::Incoming(Packet::Publish(p)) => {
            if p.topic != topics.command() {
                debug!(topic = %p.topic, "ignoring message");
                return None;
            }
            let device = Arc::clone(device);
            let payload = p.payload.to_vec();
            Some(tokio::spawn(async move {
                if let Err(e) = command::handle(device.as_ref(), &payload).await {
                    error!("command rejected: {e}");
                }
            }))
        }
        Event::Incoming(Packet::Disconnect) => {
            warn!("disconnected from MQTT broker");
            None
        }
        _ => None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
