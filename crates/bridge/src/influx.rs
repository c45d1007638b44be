//! InfluxDB v2 sink: one line-protocol record per point, written in a single
//! request per cycle.

use async_trait::async_trait;
use std::time::Duration;

use crate::point::{Point, Value};
use crate::sink::{Sink, SinkError, SinkResult};

pub struct InfluxSink {
    write_url: String,
    token: String,
    http: reqwest::Client,
}

impl InfluxSink {
    pub fn new(url: &str, token: &str, org: &str, bucket: &str, timeout: Duration) -> SinkResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let mut write_url = reqwest::Url::parse(&format!("{}/api/v2/write", url.trim_end_matches('/')))
            .map_err(|e| SinkError::InvalidUrl(format!("{url}: {e}")))?;
        write_url
            .query_pairs_mut()
            .append_pair("org", org)
            .append_pair("bucket", bucket)
            .append_pair("precision", "s");

        Ok(Self {
            write_url: write_url.to_string(),
            token: token.to_string(),
            http,
        })
    }
}

#[async_trait]
impl Sink for InfluxSink {
    fn name(&self) -> &'static str {
        "influx"
    }

    async fn write_points(&self, points: &[Point], timestamp: i64) -> SinkResult<()> {
        if points.is_empty() {
            return Ok(());
        }

        let body = line_protocol(points, timestamp);

        let response = self
            .http
            .post(&self.write_url)
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected { status, body });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Line protocol
// ---------------------------------------------------------------------------

pub(crate) fn measurement_name(point: &Point) -> String {
    format!("windhager-{}-{}", point.key, point.label)
}

/// Render `points` as newline-separated records stamped with `ts` (seconds).
pub(crate) fn line_protocol(points: &[Point], ts: i64) -> String {
    points
        .iter()
        .map(|p| {
            format!(
                "{} value={} {ts}",
                escape_measurement(&measurement_name(p)),
                field_value(&p.value)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn escape_measurement(name: &str) -> String {
    name.replace(',', "\\,").replace(' ', "\\ ")
}

fn field_value(value: &Value) -> String {
    match value {
        Value::Integer(i) => format!("{i}i"),
        Value::Float(f) => format!("{f:?}"),
        Value::Text(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
