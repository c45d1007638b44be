//! Poll scheduler: reads every registered datapoint once per wall-clock
//! quantum, coerces the readings and dispatches the batch to the sinks.
//!
//! ```text
//!  :00        :15        :30        :45
//!   │ read-all │ sleep    │ read-all │ sleep
//!   │ coerce   │ until    │ coerce   │ until
//!   │ dispatch │ boundary │ dispatch │ boundary
//! ```
//!
//! Discovery metadata is requested from the sinks at most once every
//! [`DISCOVERY_INTERVAL`]; the timestamp of the last request lives here and
//! is only touched by the poll loop.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::device::DeviceClient;
use crate::point::{coerce, Point};
use crate::registry::AddressRegistry;
use crate::sink::SinkDispatcher;

/// Cycles start on multiples of this many wall-clock seconds.
pub const QUANTUM: Duration = Duration::from_secs(15);

/// Minimum spacing between two discovery publishes.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(900);

// ---------------------------------------------------------------------------
// Discovery throttle
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct DiscoveryState {
    last: Option<Instant>,
    interval: Duration,
}

impl DiscoveryState {
    pub fn new(interval: Duration) -> Self {
        Self {
            last: None,
            interval,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    pub fn mark(&mut self, now: Instant) {
        self.last = Some(now);
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct PollScheduler {
    registry: AddressRegistry,
    device: Arc<dyn DeviceClient>,
    dispatcher: SinkDispatcher,
    discovery: DiscoveryState,
}

impl PollScheduler {
    pub fn new(
        registry: AddressRegistry,
        device: Arc<dyn DeviceClient>,
        dispatcher: SinkDispatcher,
    ) -> Self {
        Self {
            registry,
            device,
            dispatcher,
            discovery: DiscoveryState::new(DISCOVERY_INTERVAL),
        }
    }

    /// Run forever, one cycle per quantum.
    pub async fn run(mut self) {
        info!(
            datapoints = self.registry.len(),
            quantum_sec = QUANTUM.as_secs(),
            "poll loop started"
        );

        loop {
            let timestamp = OffsetDateTime::now_utc().unix_timestamp();
            self.run_cycle(Instant::now(), timestamp).await;

            let since_epoch = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            tokio::time::sleep(delay_until_next_quantum(since_epoch, QUANTUM)).await;
        }
    }

    /// One read-coerce-dispatch pass. `timestamp` is the wall-clock second
    /// the cycle started at; every sink stamps the batch with it. Returns the
    /// number of points dispatched.
    pub async fn run_cycle(&mut self, now: Instant, timestamp: i64) -> usize {
        let points = self.poll_once().await;

        let announce = self.discovery.is_due(now);
        let failures = self
            .dispatcher
            .dispatch(&self.registry, &points, timestamp, announce)
            .await;
        if announce {
            self.discovery.mark(now);
        }

        debug!(
            points = points.len(),
            datapoints = self.registry.len(),
            sink_failures = failures,
            announce,
            "cycle complete"
        );
        points.len()
    }

    /// Read every registered address. A failing address is logged and left
    /// out of the batch; the rest are still read.
    pub async fn poll_once(&self) -> Vec<Point> {
        let mut points = Vec::with_capacity(self.registry.len());

        for (address, meta) in self.registry.iter() {
            let reading = match self.device.read(address).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(address, key = %meta.key, "could not fetch data: {e}");
                    continue;
                }
            };

            let Some(coerced) = coerce(&reading) else {
                warn!(address, key = %meta.key, "invalid data: reading has no value");
                continue;
            };

            let label = meta.label();
            if coerced.fallback {
                warn!(
                    address,
                    label = %label,
                    value = %coerced.value,
                    "can not convert datapoint value, keeping text"
                );
            }

            debug!(address, label = %label, key = %meta.key, value = %coerced.value, "got datapoint");
            points.push(Point {
                address: address.to_string(),
                key: meta.key.clone(),
                label,
                value: coerced.value,
            });
        }

        points
    }
}

/// Time left until the next multiple of `quantum` since the epoch. Always
/// non-zero: a call exactly on a boundary waits a full quantum.
pub fn delay_until_next_quantum(since_epoch: Duration, quantum: Duration) -> Duration {
    let q = quantum.as_millis().max(1);
    let now = since_epoch.as_millis();
    let next = (now / q + 1) * q;
    Duration::from_millis((next - now) as u64)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{reading, FakeDevice};
    use crate::device::Reading;
    use crate::point::Value;
    use crate::sink::tests::RecordingSink;
    use serde_json::json;

    fn registry() -> AddressRegistry {
        AddressRegistry::parse(
            "/0/1/2/3/4,12-34,Outside Temp,,°C\n\
             /0/1/2/3/5,12-35,Pumpe,,Binary\n\
             /0/1/2/3/6,12-36,Uhrzeit\n",
        )
    }

    fn full_device() -> FakeDevice {
        FakeDevice::with(&[
            ("/0/1/2/3/4", reading("5.3")),
            (
                "/0/1/2/3/5",
                Reading {
                    value: Some(json!("1")),
                    min_value: Some(json!(0)),
                    max_value: Some(json!(1)),
                },
            ),
            ("/0/1/2/3/6", reading("12:30")),
        ])
    }

    fn scheduler(device: FakeDevice, sinks: Vec<RecordingSink>) -> PollScheduler {
        let sinks = sinks
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn crate::sink::Sink>)
            .collect();
        PollScheduler::new(registry(), Arc::new(device), SinkDispatcher::new(sinks))
    }

    // -- poll_once -----------------------------------------------------------

    #[tokio::test]
    async fn poll_coerces_every_datapoint() {
        let s = scheduler(full_device(), vec![]);
        let points = s.poll_once().await;

        assert_eq!(points.len(), 3);
        assert_eq!(
            points[0],
            Point {
                address: "/0/1/2/3/4".into(),
                key: "12-34".into(),
                label: "Outside_Temp".into(),
                value: Value::Float(5.3),
            }
        );
        assert_eq!(points[1].value, Value::Integer(1));
        assert_eq!(points[2].value, Value::Text("12:30".into()));
    }

    #[tokio::test]
    async fn failing_address_does_not_stop_cycle() {
        // "/0/1/2/3/5" is missing from the device, so its read fails.
        let device = FakeDevice::with(&[
            ("/0/1/2/3/4", reading("5.3")),
            ("/0/1/2/3/6", reading("7")),
        ]);
        let s = scheduler(device, vec![]);
        let points = s.poll_once().await;

        let keys: Vec<&str> = points.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["12-34", "12-36"]);
    }

    #[tokio::test]
    async fn reading_without_value_is_skipped() {
        let device = FakeDevice::with(&[
            ("/0/1/2/3/4", Reading::default()),
            ("/0/1/2/3/5", reading("0")),
            ("/0/1/2/3/6", reading("1")),
        ]);
        let s = scheduler(device, vec![]);
        assert_eq!(s.poll_once().await.len(), 2);
    }

    // -- run_cycle -----------------------------------------------------------

    #[tokio::test]
    async fn cycle_dispatches_same_batch_to_all_sinks() {
        let a = RecordingSink::failing();
        let b = RecordingSink::default();
        let mut s = scheduler(full_device(), vec![a.clone(), b.clone()]);

        let n = s.run_cycle(Instant::now(), 1_700_000_010).await;

        assert_eq!(n, 3);
        assert_eq!(a.batches(), b.batches());
        assert_eq!(a.timestamps(), vec![1_700_000_010]);
        assert_eq!(b.timestamps(), vec![1_700_000_010]);
        assert_eq!(b.batches()[0].len(), 3);
    }

    #[tokio::test]
    async fn discovery_announced_twice_over_901_seconds() {
        let sink = RecordingSink::default();
        let mut s = scheduler(full_device(), vec![sink.clone()]);

        let start = Instant::now();
        for t in 0..=901u64 {
            s.run_cycle(start + Duration::from_secs(t), t as i64).await;
        }

        assert_eq!(sink.announcements(), 2);
        assert_eq!(sink.batches().len(), 902);
    }

    #[tokio::test]
    async fn failed_announce_still_counts_as_published() {
        let sink = RecordingSink {
            fail_announce: true,
            ..Default::default()
        };
        let mut s = scheduler(full_device(), vec![sink.clone()]);

        let start = Instant::now();
        s.run_cycle(start, 0).await;
        s.run_cycle(start + Duration::from_secs(15), 15).await;

        assert_eq!(sink.announcements(), 1);
    }

    // -- DiscoveryState ------------------------------------------------------

    #[test]
    fn discovery_due_initially() {
        let d = DiscoveryState::new(DISCOVERY_INTERVAL);
        assert!(d.is_due(Instant::now()));
    }

    #[test]
    fn discovery_not_due_within_interval() {
        let mut d = DiscoveryState::new(DISCOVERY_INTERVAL);
        let t0 = Instant::now();
        d.mark(t0);
        assert!(!d.is_due(t0 + Duration::from_secs(899)));
        assert!(d.is_due(t0 + Duration::from_secs(900)));
    }

    // -- delay_until_next_quantum -------------------------------------------

    #[test]
    fn delay_aligns_to_wall_clock_boundary() {
        let d = delay_until_next_quantum(Duration::from_secs(1_700_000_007), QUANTUM);
        // 1_700_000_007 % 15 == 12, so the next boundary is 3 s away.
        assert_eq!(d, Duration::from_secs(3));
    }

    #[test]
    fn delay_on_boundary_waits_full_quantum() {
        let d = delay_until_next_quantum(Duration::from_secs(1_700_000_010), QUANTUM);
        assert_eq!(d, QUANTUM);
    }

    #[test]
    fn delay_accounts_for_sub_second_offset() {
        let d = delay_until_next_quantum(Duration::from_millis(1_700_000_009_250), QUANTUM);
        assert_eq!(d, Duration::from_millis(750));
    }
}
