//! Data shapes flowing through the pipeline: raw chunks in, time series out.

use serde::{Deserialize, Serialize};

/// A label name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    /// Label name.
    pub name: String,
    /// Label value.
    pub value: String,
}

impl Label {
    /// Creates a label.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One column of raw values in a [`Chunk`]. `None` marks a null cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Field name; empty for single-valued series.
    pub field: String,
    /// Values aligned with [`Chunk::timestamps`].
    pub values: Vec<Option<f64>>,
}

/// One retrieval unit of raw samples for a single series or measurement.
///
/// Samples are in the order the source emitted them (chronological).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Measurement (InfluxDB) or metric name (Prometheus).
    pub measurement: String,
    /// Series labels as read from the source.
    pub labels: Vec<Label>,
    /// Sample timestamps in unix milliseconds.
    pub timestamps: Vec<i64>,
    /// One or more value columns.
    pub columns: Vec<Column>,
}

impl Chunk {
    /// Builds a single-valued chunk.
    pub fn single(
        measurement: impl Into<String>,
        labels: Vec<Label>,
        timestamps: Vec<i64>,
        values: Vec<f64>,
    ) -> Self {
        Self {
            measurement: measurement.into(),
            labels,
            timestamps,
            columns: vec![Column {
                field: String::new(),
                values: values.into_iter().map(Some).collect(),
            }],
        }
    }

    /// Number of rows in the chunk.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether the chunk holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// The normalized unit the target accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Metric name.
    pub name: String,
    /// Unique, sorted label set.
    pub labels: Vec<Label>,
    /// Unix milliseconds.
    pub timestamp: i64,
    /// Sample value.
    pub value: f64,
}

/// A run of [`Point`]s sharing one series, kept columnar for the wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Metric name.
    pub name: String,
    /// Unique, sorted label set.
    pub labels: Vec<Label>,
    /// Unix milliseconds, aligned with `values`.
    pub timestamps: Vec<i64>,
    /// Sample values.
    pub values: Vec<f64>,
}

impl TimeSeries {
    /// Creates an empty series.
    pub fn new(name: impl Into<String>, labels: Vec<Label>) -> Self {
        Self {
            name: name.into(),
            labels,
            timestamps: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Appends one sample.
    pub fn push(&mut self, timestamp: i64, value: f64) {
        self.timestamps.push(timestamp);
        self.values.push(value);
    }

    /// Number of points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether the series holds no points.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Splits off the points from `at` onward into a new series.
    ///
    /// `self` keeps `[0, at)`.
    #[must_use]
    pub fn split_off(&mut self, at: usize) -> Self {
        Self {
            name: self.name.clone(),
            labels: self.labels.clone(),
            timestamps: self.timestamps.split_off(at),
            values: self.values.split_off(at),
        }
    }

    /// Iterates the series as individual points.
    pub fn points(&self) -> impl Iterator<Item = Point> + '_ {
        self.timestamps
            .iter()
            .zip(&self.values)
            .map(|(&timestamp, &value)| Point {
                name: self.name.clone(),
                labels: self.labels.clone(),
                timestamp,
                value,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_off_keeps_order() {
        let mut ts = TimeSeries::new("cpu_usage", vec![Label::new("host", "a")]);
        for i in 0..5 {
            ts.push(i, i as f64);
        }

        let tail = ts.split_off(3);

        assert_eq!(ts.timestamps, vec![0, 1, 2]);
        assert_eq!(tail.timestamps, vec![3, 4]);
        assert_eq!(tail.values, vec![3.0, 4.0]);
        assert_eq!(tail.labels, ts.labels);
    }

    #[test]
    fn test_points_expand_series() {
        let mut ts = TimeSeries::new("up", vec![]);
        ts.push(10, 1.0);
        ts.push(20, 0.0);

        let points: Vec<Point> = ts.points().collect();

        assert_eq!(points.len(), 2);
        assert_eq!(points[1].timestamp, 20);
        assert_eq!(points[1].name, "up");
    }

    #[test]
    fn test_single_chunk() {
        let chunk = Chunk::single("up", vec![], vec![1, 2], vec![1.0, 1.0]);
        assert_eq!(chunk.len(), 2);
        assert_eq!(chunk.columns.len(), 1);
        assert!(chunk.columns[0].field.is_empty());
    }
}
