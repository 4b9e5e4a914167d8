//! Selection of the data subset to migrate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Time window and series/label selector applied by every source reader.
///
/// Empty bounds mean unbounded. Construct with [`Filter::parse`] or
/// [`Filter::builder`]; a filter is never mutated once a run starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Source-specific series selector (InfluxQL `SHOW SERIES` clause).
    #[serde(default)]
    pub series: String,
    /// Inclusive lower bound.
    #[serde(default)]
    pub time_start: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    #[serde(default)]
    pub time_end: Option<DateTime<Utc>>,
    /// Label name to match (Prometheus snapshots).
    #[serde(default)]
    pub label: Option<String>,
    /// Regular expression the label value must fully match.
    #[serde(default)]
    pub label_value: Option<String>,
}

impl Filter {
    /// Parses a filter from operator input. Empty strings are unbounded/unset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFilter`] when a bound is not RFC3339 or the
    /// resulting filter fails [`Filter::validate`].
    pub fn parse(
        series: &str,
        time_start: &str,
        time_end: &str,
        label: &str,
        label_value: &str,
    ) -> Result<Self> {
        let filter = Self {
            series: series.trim().to_string(),
            time_start: parse_bound("time start", time_start)?,
            time_end: parse_bound("time end", time_end)?,
            label: non_empty(label),
            label_value: non_empty(label_value),
        };
        filter.validate()?;
        Ok(filter)
    }

    /// Starts a builder for programmatic construction.
    #[must_use]
    pub fn builder() -> FilterBuilder {
        FilterBuilder::default()
    }

    /// Checks the filter invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFilter`] if `time_start > time_end` or a label
    /// value is given without a label name.
    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (self.time_start, self.time_end) {
            if start > end {
                return Err(Error::InvalidFilter(format!(
                    "time start {} is after time end {}",
                    start.to_rfc3339(),
                    end.to_rfc3339()
                )));
            }
        }
        if self.label.is_none() && self.label_value.is_some() {
            return Err(Error::InvalidFilter(
                "label value given without a label name".to_string(),
            ));
        }
        Ok(())
    }

    /// Lower bound in unix milliseconds, `i64::MIN` when unbounded.
    ///
    /// Rounded up, so a sub-millisecond start never admits the millisecond
    /// before it.
    #[must_use]
    pub fn start_millis(&self) -> i64 {
        self.time_start.map_or(i64::MIN, |t| {
            let partial = t.timestamp_subsec_nanos() % 1_000_000 != 0;
            t.timestamp_millis() + i64::from(partial)
        })
    }

    /// Upper bound in unix milliseconds, `i64::MAX` when unbounded.
    #[must_use]
    pub fn end_millis(&self) -> i64 {
        self.time_end.map_or(i64::MAX, |t| t.timestamp_millis())
    }

    /// Whether a millisecond timestamp falls inside the window.
    #[must_use]
    pub fn contains(&self, ts_millis: i64) -> bool {
        ts_millis >= self.start_millis() && ts_millis <= self.end_millis()
    }

    /// Whether the half-open range `[min, max)` overlaps the window.
    #[must_use]
    pub fn overlaps(&self, min: i64, max: i64) -> bool {
        min <= self.end_millis() && max > self.start_millis()
    }
}

/// Builder for [`Filter`].
#[derive(Debug, Default)]
pub struct FilterBuilder {
    inner: Filter,
}

impl FilterBuilder {
    /// Sets the series selector.
    #[must_use]
    pub fn series(mut self, series: impl Into<String>) -> Self {
        self.inner.series = series.into();
        self
    }

    /// Sets the inclusive lower bound.
    #[must_use]
    pub fn time_start(mut self, start: DateTime<Utc>) -> Self {
        self.inner.time_start = Some(start);
        self
    }

    /// Sets the inclusive upper bound.
    #[must_use]
    pub fn time_end(mut self, end: DateTime<Utc>) -> Self {
        self.inner.time_end = Some(end);
        self
    }

    /// Sets the label matcher.
    #[must_use]
    pub fn label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.label = Some(name.into());
        self.inner.label_value = Some(value.into());
        self
    }

    /// Validates and returns the filter.
    ///
    /// # Errors
    ///
    /// See [`Filter::validate`].
    pub fn build(self) -> Result<Filter> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

fn parse_bound(what: &str, raw: &str) -> Result<Option<DateTime<Utc>>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|e| Error::InvalidFilter(format!("{} '{}' is not RFC3339: {}", what, raw, e)))
}

fn non_empty(raw: &str) -> Option<String> {
    let raw = raw.trim();
    (!raw.is_empty()).then(|| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn test_parse_empty_is_unbounded() {
        let filter = Filter::parse("", "", "", "", "").unwrap();
        assert_eq!(filter.start_millis(), i64::MIN);
        assert_eq!(filter.end_millis(), i64::MAX);
        assert!(filter.contains(0));
    }

    #[test]
    fn test_parse_rfc3339_bounds() {
        let filter = Filter::parse(
            "on cpu",
            "2020-01-01T00:00:00Z",
            "2020-01-01T01:00:00+01:00",
            "",
            "",
        )
        .unwrap();
        assert_eq!(filter.series, "on cpu");
        assert_eq!(filter.start_millis(), 1_577_836_800_000);
        // +01:00 offset normalizes to the same instant
        assert_eq!(filter.end_millis(), 1_577_836_800_000);
    }

    #[test]
    fn test_sub_millisecond_start_rounds_up() {
        let filter = Filter::parse(
            "",
            "2020-01-01T00:00:00.0005Z",
            "2020-01-01T00:00:00.0025Z",
            "",
            "",
        )
        .unwrap();
        assert_eq!(filter.start_millis(), 1_577_836_800_001);
        assert_eq!(filter.end_millis(), 1_577_836_800_002);
        assert!(!filter.contains(1_577_836_800_000));
        assert!(filter.contains(1_577_836_800_001));
        assert!(filter.contains(1_577_836_800_002));
    }

    #[test]
    fn test_parse_rejects_garbage_bound() {
        let err = Filter::parse("", "yesterday", "", "", "").unwrap_err();
        assert!(matches!(err, Error::InvalidFilter(_)));
    }

    #[test]
    fn test_inverted_window_rejected() {
        let result = Filter::parse("", "2021-01-02T00:00:00Z", "2021-01-01T00:00:00Z", "", "");
        assert!(matches!(result, Err(Error::InvalidFilter(_))));
    }

    #[test]
    fn test_label_value_requires_label() {
        let filter = Filter {
            label_value: Some("prod".to_string()),
            ..Default::default()
        };
        assert!(filter.validate().is_err());
    }

    #[test]
    fn test_overlaps_half_open() {
        let filter = Filter::builder()
            .time_start(Utc.timestamp_millis_opt(100).unwrap())
            .time_end(Utc.timestamp_millis_opt(200).unwrap())
            .build()
            .unwrap();
        assert!(filter.overlaps(150, 300));
        assert!(filter.overlaps(200, 201));
        assert!(!filter.overlaps(0, 100));
        assert!(!filter.overlaps(201, 300));
    }

    proptest! {
        #[test]
        fn prop_start_after_end_never_validates(start in 1i64..4_000_000_000_000, gap in 1i64..1_000_000) {
            let filter = Filter {
                time_start: Utc.timestamp_millis_opt(start).single(),
                time_end: Utc.timestamp_millis_opt(start - gap).single(),
                ..Default::default()
            };
            prop_assert!(filter.validate().is_err());
        }
    }
}
