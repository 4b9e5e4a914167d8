//! Target writers and the batch they accept.

pub mod victoria;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::io::Write;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::model::{Label, TimeSeries};
use crate::transform::METRIC_NAME_LABEL;

pub use victoria::{VmConfig, VmWriter};

/// An ordered group of series written in one call, bounded by point count.
#[derive(Debug, Clone)]
pub struct Batch {
    series: Vec<TimeSeries>,
    points: usize,
    capacity: usize,
}

impl Batch {
    /// Creates an empty batch holding at most `capacity` points.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            series: Vec::new(),
            points: 0,
            capacity: capacity.max(1),
        }
    }

    /// Adds a series, splitting it at the capacity boundary.
    ///
    /// Returns the points that did not fit, in their original order.
    pub fn push(&mut self, mut ts: TimeSeries) -> Option<TimeSeries> {
        let room = self.capacity - self.points;
        let overflow = (ts.len() > room).then(|| ts.split_off(room));
        if !ts.is_empty() {
            self.points += ts.len();
            self.series.push(ts);
        }
        overflow
    }

    /// Number of points in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points
    }

    /// Whether the batch holds no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points == 0
    }

    /// Whether the batch reached its capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.points >= self.capacity
    }

    /// Series in insertion order.
    #[must_use]
    pub fn series(&self) -> &[TimeSeries] {
        &self.series
    }

    /// Empties the batch, keeping its capacity.
    pub fn clear(&mut self) {
        self.series.clear();
        self.points = 0;
    }

    /// Encodes the batch as newline-delimited JSON in the VictoriaMetrics
    /// `/api/v1/import` format.
    ///
    /// Non-finite samples have no JSON representation and are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode_json_lines(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.points * 24);
        for ts in &self.series {
            if ts.values.iter().all(|v| v.is_finite()) {
                write_line(&mut buf, ts, &ts.values, &ts.timestamps)?;
            } else {
                let (timestamps, values): (Vec<i64>, Vec<f64>) = ts
                    .timestamps
                    .iter()
                    .zip(&ts.values)
                    .filter(|(_, v)| v.is_finite())
                    .unzip();
                debug!(
                    "Dropping {} non-finite samples of {}",
                    ts.len() - values.len(),
                    ts.name
                );
                if !values.is_empty() {
                    write_line(&mut buf, ts, &values, &timestamps)?;
                }
            }
        }
        Ok(buf)
    }

    /// Encodes the batch, gzip-compressed when `compress` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or compression fails.
    pub fn encode(&self, compress: bool) -> Result<Vec<u8>> {
        let body = self.encode_json_lines()?;
        if !compress {
            return Ok(body);
        }
        let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 4), Compression::default());
        encoder.write_all(&body)?;
        Ok(encoder.finish()?)
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    metric: MetricName<'a>,
    values: &'a [f64],
    timestamps: &'a [i64],
}

struct MetricName<'a> {
    name: &'a str,
    labels: &'a [Label],
}

impl Serialize for MetricName<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.labels.len() + 1))?;
        map.serialize_entry(METRIC_NAME_LABEL, self.name)?;
        for label in self.labels {
            map.serialize_entry(&label.name, &label.value)?;
        }
        map.end()
    }
}

fn write_line(buf: &mut Vec<u8>, ts: &TimeSeries, values: &[f64], timestamps: &[i64]) -> Result<()> {
    let line = JsonLine {
        metric: MetricName {
            name: &ts.name,
            labels: &ts.labels,
        },
        values,
        timestamps,
    };
    serde_json::to_writer(&mut *buf, &line)?;
    buf.push(b'\n');
    Ok(())
}

/// Destination database ingestion endpoint.
///
/// Implement this trait to add support for a new target.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// Get the target type name.
    fn target_type(&self) -> &'static str;

    /// Checks the target is reachable and accepts the credentials.
    async fn ping(&self) -> Result<()>;

    /// Writes one batch.
    ///
    /// Fails with `WriteRetryable` for transient problems, `WriteFatal` for
    /// a permanent rejection of this batch, and `Authentication` when the
    /// target refuses the credentials.
    async fn write(&self, batch: &Batch) -> Result<()>;
}

/// Writer that accepts everything and stores nothing (dry runs).
#[derive(Debug, Default)]
pub struct DiscardWriter;

#[async_trait]
impl TargetWriter for DiscardWriter {
    fn target_type(&self) -> &'static str {
        "discard"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn write(&self, batch: &Batch) -> Result<()> {
        debug!("Dry run: discarding batch of {} points", batch.len());
        Ok(())
    }
}

/// Create a target writer from configuration.
pub fn create_writer(config: &VmConfig, dry_run: bool) -> Arc<dyn TargetWriter> {
    if dry_run {
        Arc::new(DiscardWriter)
    } else {
        Arc::new(VmWriter::new(config.clone()))
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
