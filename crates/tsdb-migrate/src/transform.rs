//! Record transformation: raw chunks into normalized time series.
//!
//! Transformation is pure. The same chunk always yields the same series, so a
//! chunk can be replayed after a failure without side effects.

use std::collections::{BTreeMap, HashMap};

use crate::model::{Chunk, Label, TimeSeries};

/// Name of the label Prometheus uses to carry the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Transformation rules fixed for a run.
#[derive(Debug, Clone)]
pub struct TransformConfig {
    /// Separator between measurement and field in composed metric names.
    pub separator: String,
    /// Significant figures to keep; `0` disables rounding.
    pub significant_figures: u32,
    /// Label renames (`source_name` -> `target_name`).
    pub label_renames: HashMap<String, String>,
    /// Labels attached to every series (override source labels).
    pub extra_labels: Vec<Label>,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            separator: "_".to_string(),
            significant_figures: 0,
            label_renames: HashMap::new(),
            extra_labels: Vec::new(),
        }
    }
}

/// Converts raw chunks into the target's series representation.
#[derive(Debug, Clone, Default)]
pub struct Transformer {
    config: TransformConfig,
}

impl Transformer {
    /// Creates a transformer with the given rules.
    #[must_use]
    pub fn new(config: TransformConfig) -> Self {
        Self { config }
    }

    /// Unpacks every column of `chunk` into its own series.
    ///
    /// Null cells are skipped and columns with no values produce nothing.
    #[must_use]
    pub fn transform(&self, chunk: &Chunk) -> Vec<TimeSeries> {
        let labels = self.normalize_labels(&chunk.labels);
        let mut out = Vec::with_capacity(chunk.columns.len());

        for column in &chunk.columns {
            let name = self.series_name(&chunk.measurement, &column.field);
            let mut series = TimeSeries::new(name, labels.clone());
            for (&ts, value) in chunk.timestamps.iter().zip(&column.values) {
                if let Some(v) = value {
                    series.push(ts, round_to_significant(*v, self.config.significant_figures));
                }
            }
            if !series.is_empty() {
                out.push(series);
            }
        }

        out
    }

    /// Transforms a sequence of chunks.
    #[must_use]
    pub fn transform_batch(&self, chunks: &[Chunk]) -> Vec<TimeSeries> {
        chunks.iter().flat_map(|c| self.transform(c)).collect()
    }

    fn series_name(&self, measurement: &str, field: &str) -> String {
        match (measurement.is_empty(), field.is_empty()) {
            (_, true) => measurement.to_string(),
            (true, false) => field.to_string(),
            (false, false) => format!("{}{}{}", measurement, self.config.separator, field),
        }
    }

    fn normalize_labels(&self, labels: &[Label]) -> Vec<Label> {
        // BTreeMap gives unique keys (last write wins) in sorted order
        let mut set = BTreeMap::new();
        for label in labels {
            if label.name == METRIC_NAME_LABEL {
                continue;
            }
            let name = self
                .config
                .label_renames
                .get(&label.name)
                .cloned()
                .unwrap_or_else(|| label.name.clone());
            set.insert(name, label.value.clone());
        }
        for label in &self.config.extra_labels {
            set.insert(label.name.clone(), label.value.clone());
        }
        set.into_iter()
            .map(|(name, value)| Label { name, value })
            .collect()
    }
}

/// Rounds `value` to `figures` significant figures, ties to even.
///
/// `figures == 0` disables rounding. Zero, NaN and infinities pass through.
#[must_use]
pub fn round_to_significant(value: f64, figures: u32) -> f64 {
    if figures == 0 || value == 0.0 || !value.is_finite() {
        return value;
    }

    let magnitude = decimal_exponent(value.abs());
    let shift = figures as i32 - 1 - magnitude;
    let rounded = if shift >= 0 {
        let scale = pow10(shift);
        let scaled = value * scale;
        if !scaled.is_finite() {
            return value;
        }
        scaled.round_ties_even() / scale
    } else {
        let scale = pow10(-shift);
        (value / scale).round_ties_even() * scale
    };

    if rounded.is_finite() {
        rounded
    } else {
        value
    }
}

/// `floor(log10(v))` for positive finite `v`, corrected for `log10` drift.
fn decimal_exponent(v: f64) -> i32 {
    let mut exp = v.log10().floor() as i32;
    if pow10(exp) > v {
        exp -= 1;
    } else if pow10(exp + 1) <= v {
        exp += 1;
    }
    exp
}

fn pow10(exp: i32) -> f64 {
    10f64.powi(exp)
}
