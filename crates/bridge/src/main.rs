mod command;
mod config;
mod device;
mod influx;
mod mqtt;
mod point;
mod registry;
mod scheduler;
mod sink;

use anyhow::{Context, Result};
use rumqttc::AsyncClient;
use std::{env, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use device::{DeviceClient, HttpDeviceClient};
use influx::InfluxSink;
use mqtt::{MqttSink, Topics};
use registry::AddressRegistry;
use scheduler::PollScheduler;
use sink::{Sink, SinkDispatcher};

/// Spare request slots in the MQTT client channel beyond one discovery
/// message per datapoint.
const MQTT_CHANNEL_HEADROOM: usize = 16;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;

    // ── Datapoint list ──────────────────────────────────────────────
    let registry = AddressRegistry::load(&cfg.datapoints_file)?;
    if registry.is_empty() {
        warn!(file = %cfg.datapoints_file, "no datapoints configured");
    }
    info!(datapoints = registry.len(), "datapoint list loaded");

    // ── Device ──────────────────────────────────────────────────────
    let device: Arc<dyn DeviceClient> = Arc::new(
        HttpDeviceClient::new(
            &cfg.device.url,
            &cfg.device.user,
            &cfg.device.password,
            cfg.device.timeout(),
        )
        .context("failed to build device client")?,
    );

    // ── Sinks ───────────────────────────────────────────────────────
    let mut sinks: Vec<Box<dyn Sink>> = Vec::new();

    if let Some(i) = cfg.influx() {
        let sink = InfluxSink::new(&i.url, &i.token, &i.org, &i.bucket, i.timeout())
            .context("failed to build InfluxDB sink")?;
        info!(url = %i.url, bucket = %i.bucket, "InfluxDB sink enabled");
        sinks.push(Box::new(sink));
    }

    if let Some(m) = cfg.mqtt() {
        let topics = Topics::from_settings(m);
        let (client, eventloop) = AsyncClient::new(
            mqtt::options(m, &topics),
            registry.len() + MQTT_CHANNEL_HEADROOM,
        );

        tokio::spawn(mqtt::run_event_loop(
            eventloop,
            client.clone(),
            topics.clone(),
            Arc::clone(&device),
        ));

        info!(host = %m.host, port = m.port, base = %m.base_topic, "MQTT sink enabled");
        sinks.push(Box::new(MqttSink::new(client, topics)));
    }

    let dispatcher = SinkDispatcher::new(sinks);
    if dispatcher.is_empty() {
        warn!("no sinks enabled; readings will only be logged");
    }

    info!("initialization done");
    PollScheduler::new(registry, device, dispatcher).run().await;
    Ok(())
}
