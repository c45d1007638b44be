//! Downstream sinks and the dispatcher that fans each batch out to them.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error};

use crate::point::Point;
use crate::registry::AddressRegistry;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server rejected write with status {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("MQTT publish failed: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("MQTT publish timed out")]
    Timeout,

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{failed} of {total} discovery messages failed")]
    Discovery { failed: usize, total: usize },
}

pub type SinkResult<T> = Result<T, SinkError>;

#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Write one poll cycle's points. `timestamp` is the cycle's start in
    /// unix seconds, shared by every sink.
    async fn write_points(&self, points: &[Point], timestamp: i64) -> SinkResult<()>;

    /// Publish rendering metadata for every registered datapoint. Sinks
    /// without such a notion keep the default no-op.
    async fn announce(&self, _registry: &AddressRegistry) -> SinkResult<()> {
        Ok(())
    }
}

/// Calls every sink independently; a failing sink is logged and never
/// prevents the others from receiving the batch.
pub struct SinkDispatcher {
    sinks: Vec<Box<dyn Sink>>,
}

impl SinkDispatcher {
    pub fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        Self { sinks }
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Returns the number of failed sink calls.
    pub async fn dispatch(
        &self,
        registry: &AddressRegistry,
        points: &[Point],
        timestamp: i64,
        announce: bool,
    ) -> usize {
        let mut failures = 0;

        for sink in &self.sinks {
            if announce {
                if let Err(e) = sink.announce(registry).await {
                    error!(sink = sink.name(), "discovery publish failed: {e}");
                    failures += 1;
                }
            }

            match sink.write_points(points, timestamp).await {
                Ok(()) => debug!(sink = sink.name(), points = points.len(), "batch written"),
                Err(e) => {
                    error!(sink = sink.name(), points = points.len(), "write failed: {e}");
                    failures += 1;
                }
            }
        }

        failures
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::point::Value;
    use std::sync::{Arc, Mutex};

    /// Records every call; optionally fails writes and/or announcements.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingSink {
        pub(crate) fail_writes: bool,
        pub(crate) fail_announce: bool,
        pub(crate) batches: Arc<Mutex<Vec<Vec<Point>>>>,
        pub(crate) timestamps: Arc<Mutex<Vec<i64>>>,
        pub(crate) announcements: Arc<Mutex<usize>>,
    }

    impl RecordingSink {
        pub(crate) fn failing() -> Self {
            Self {
                fail_writes: true,
                fail_announce: true,
                ..Default::default()
            }
        }

        pub(crate) fn batches(&self) -> Vec<Vec<Point>> {
            self.batches.lock().unwrap().clone()
        }

        pub(crate) fn timestamps(&self) -> Vec<i64> {
            self.timestamps.lock().unwrap().clone()
        }

        pub(crate) fn announcements(&self) -> usize {
            *self.announcements.lock().unwrap()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn write_points(&self, points: &[Point], timestamp: i64) -> SinkResult<()> {
            self.batches.lock().unwrap().push(points.to_vec());
            self.timestamps.lock().unwrap().push(timestamp);
            if self.fail_writes {
                return Err(SinkError::Rejected {
                    status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                    body: "boom".into(),
                });
            }
            Ok(())
        }

        async fn announce(&self, _registry: &AddressRegistry) -> SinkResult<()> {
            *self.announcements.lock().unwrap() += 1;
            if self.fail_announce {
                return Err(SinkError::Discovery { failed: 1, total: 1 });
            }
            Ok(())
        }
    }

    fn batch() -> Vec<Point> {
        vec![Point {
            address: "/0/1/2/3/4".into(),
            key: "12-34".into(),
            label: "Outside_Temp".into(),
            value: Value::Float(5.3),
        }]
    }

    #[tokio::test]
    async fn failing_sink_does_not_block_other() {
        let bad = RecordingSink::failing();
        let good = RecordingSink::default();
        let dispatcher = SinkDispatcher::new(vec![Box::new(bad.clone()), Box::new(good.clone())]);

        let failures = dispatcher
            .dispatch(&AddressRegistry::default(), &batch(), 1, true)
            .await;

        assert_eq!(failures, 2);
        assert_eq!(good.batches(), vec![batch()]);
        assert_eq!(good.announcements(), 1);
    }

    #[tokio::test]
    async fn failed_announce_still_writes_same_sink() {
        let sink = RecordingSink {
            fail_announce: true,
            ..Default::default()
        };
        let dispatcher = SinkDispatcher::new(vec![Box::new(sink.clone())]);

        let failures = dispatcher
            .dispatch(&AddressRegistry::default(), &batch(), 1, true)
            .await;

        assert_eq!(failures, 1);
        assert_eq!(sink.batches().len(), 1);
    }

    #[tokio::test]
    async fn announce_only_when_requested() {
        let sink = RecordingSink::default();
        let dispatcher = SinkDispatcher::new(vec![Box::new(sink.clone())]);

        dispatcher
            .dispatch(&AddressRegistry::default(), &batch(), 1, false)
            .await;

        assert_eq!(sink.announcements(), 0);
        assert_eq!(sink.batches().len(), 1);
    }
}
