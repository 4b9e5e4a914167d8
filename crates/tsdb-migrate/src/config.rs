//! Configuration types for tsdb-migrate.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::http::validate_url;
use crate::importer::ImporterConfig;
use crate::model::Label;
use crate::processor::ProcessorOptions;
use crate::retry::{RetryConfig, RetrySettings};
use crate::sources::{InfluxConfig, PrometheusConfig};
use crate::target::VmConfig;
use crate::transform::TransformConfig;

/// Main migration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Source configuration.
    pub source: SourceConfig,
    /// Data subset to migrate.
    #[serde(default)]
    pub filter: Filter,
    /// Destination VictoriaMetrics configuration.
    #[serde(default)]
    pub target: VmConfig,
    /// Migration options.
    #[serde(default)]
    pub options: MigrationOptions,
}

/// Source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceConfig {
    /// InfluxDB 1.x over HTTP.
    #[serde(rename = "influx")]
    Influx(InfluxConfig),
    /// Prometheus snapshot directory.
    #[serde(rename = "prometheus")]
    Prometheus(PrometheusConfig),
}

impl SourceConfig {
    /// Source kind name.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Influx(_) => "influx",
            Self::Prometheus(_) => "prometheus",
        }
    }
}

/// Migration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationOptions {
    /// Number of extraction workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Number of import workers (concurrent writes to the target).
    #[serde(default = "default_import_concurrency")]
    pub import_concurrency: usize,
    /// Points per import batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batch-sized entries buffered between extraction and import; 0 derives it from
    /// `import_concurrency`.
    #[serde(default)]
    pub queue_capacity: usize,
    /// Significant figures to keep; 0 disables rounding.
    #[serde(default)]
    pub significant_figures: u32,
    /// Separator between measurement and field in metric names.
    #[serde(default = "default_separator")]
    pub measurement_field_separator: String,
    /// Idle flush interval in milliseconds; 0 disables idle flushes.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Bound on each shutdown phase after cancellation, in milliseconds.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Write retry policy.
    #[serde(default)]
    pub retry: RetrySettings,
    /// Hide the progress bar.
    #[serde(default)]
    pub silent: bool,
    /// Read and transform everything but write nothing.
    #[serde(default)]
    pub dry_run: bool,
    /// Label renames (`source_name` -> `target_name`).
    #[serde(default)]
    pub label_renames: HashMap<String, String>,
    /// Labels added to every series.
    #[serde(default)]
    pub extra_labels: BTreeMap<String, String>,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            import_concurrency: default_import_concurrency(),
            batch_size: default_batch_size(),
            queue_capacity: 0,
            significant_figures: 0,
            measurement_field_separator: default_separator(),
            flush_interval_ms: default_flush_interval_ms(),
            grace_period_ms: default_grace_period_ms(),
            retry: RetrySettings::default(),
            silent: false,
            dry_run: false,
            label_renames: HashMap::new(),
            extra_labels: BTreeMap::new(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}

fn default_import_concurrency() -> usize {
    2
}

fn default_batch_size() -> usize {
    200_000
}

fn default_separator() -> String {
    "_".to_string()
}

fn default_flush_interval_ms() -> u64 {
    5_000
}

fn default_grace_period_ms() -> u64 {
    5_000
}

impl MigrationOptions {
    /// Queue capacity in series, derived when not set.
    #[must_use]
    pub fn effective_queue_capacity(&self) -> usize {
        if self.queue_capacity == 0 {
            self.import_concurrency.max(1) * 4
        } else {
            self.queue_capacity
        }
    }

    /// Importer settings.
    #[must_use]
    pub fn importer_config(&self) -> ImporterConfig {
        ImporterConfig {
            concurrency: self.import_concurrency,
            batch_size: self.batch_size,
            queue_capacity: self.effective_queue_capacity(),
            flush_interval: (self.flush_interval_ms > 0)
                .then(|| Duration::from_millis(self.flush_interval_ms)),
            retry: RetryConfig::from(&self.retry),
        }
    }

    /// Transformer rules.
    #[must_use]
    pub fn transform_config(&self) -> TransformConfig {
        TransformConfig {
            separator: self.measurement_field_separator.clone(),
            significant_figures: self.significant_figures,
            label_renames: self.label_renames.clone(),
            extra_labels: self
                .extra_labels
                .iter()
                .map(|(k, v)| Label::new(k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Extraction settings.
    #[must_use]
    pub fn processor_options(&self) -> ProcessorOptions {
        ProcessorOptions {
            concurrency: self.concurrency,
            grace_period: Duration::from_millis(self.grace_period_ms),
            silent: self.silent,
        }
    }
}

impl MigrationConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match &self.source {
            SourceConfig::Influx(influx) => {
                validate_url(&influx.addr)?;
                if influx.database.is_empty() {
                    return Err(Error::Config("influx database cannot be empty".to_string()));
                }
                if influx.chunk_size == 0 {
                    return Err(Error::Config("chunk size must be greater than 0".to_string()));
                }
            }
            SourceConfig::Prometheus(prom) => {
                if prom.snapshot.as_os_str().is_empty() {
                    return Err(Error::Config("snapshot path cannot be empty".to_string()));
                }
            }
        }

        if !self.options.dry_run {
            validate_url(&self.target.addr)?;
        }
        if self.options.concurrency == 0 {
            return Err(Error::Config("concurrency must be greater than 0".to_string()));
        }
        if self.options.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config(
                "backoff multiplier must be at least 1.0".to_string(),
            ));
        }
        self.options.importer_config().validate()?;
        self.filter.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn prometheus_config() -> MigrationConfig {
        MigrationConfig {
            source: SourceConfig::Prometheus(PrometheusConfig {
                snapshot: PathBuf::from("/var/lib/prometheus/snapshots/20240101"),
            }),
            filter: Filter::default(),
            target: VmConfig::default(),
            options: MigrationOptions::default(),
        }
    }

    #[test]
    fn test_config_defaults() {
        let options = MigrationOptions::default();
        assert_eq!(options.concurrency, 4);
        assert_eq!(options.import_concurrency, 2);
        assert_eq!(options.batch_size, 200_000);
        assert_eq!(options.effective_queue_capacity(), 8);
        assert_eq!(options.measurement_field_separator, "_");
        assert!(!options.dry_run);
    }

    #[test]
    fn test_importer_config_mapping() {
        let mut options = MigrationOptions {
            flush_interval_ms: 0,
            queue_capacity: 3,
            ..Default::default()
        };
        let importer = options.importer_config();
        assert!(importer.flush_interval.is_none());
        assert_eq!(importer.queue_capacity, 3);
        assert_eq!(importer.retry.max_retries, 3);

        options.flush_interval_ms = 250;
        assert_eq!(
            options.importer_config().flush_interval,
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_transform_config_mapping() {
        let mut options = MigrationOptions::default();
        options.significant_figures = 3;
        options
            .extra_labels
            .insert("source".to_string(), "legacy".to_string());

        let transform = options.transform_config();
        assert_eq!(transform.significant_figures, 3);
        assert_eq!(transform.extra_labels, vec![Label::new("source", "legacy")]);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut config = prometheus_config();
        assert!(config.validate().is_ok());

        config.options.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = prometheus_config();
        config.options.import_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_checks_filter_and_target() {
        let mut config = prometheus_config();
        config.filter.label_value = Some("node.*".to_string());
        assert!(matches!(config.validate(), Err(Error::InvalidFilter(_))));

        let mut config = prometheus_config();
        config.target.addr = "localhost:8428".to_string();
        assert!(config.validate().is_err());

        config.options.dry_run = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_yaml_parse_influx() {
        let yaml = r#"
source:
  type: influx
  addr: http://influx:8086
  database: telegraf
  chunk_size: 5000
filter:
  series: "FROM cpu"
  time_start: "2024-01-01T00:00:00Z"
target:
  addr: http://vminsert:8480
  account_id: "42"
options:
  import_concurrency: 8
  significant_figures: 4
  retry:
    max_retries: 5
"#;
        let config: MigrationConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.source.kind(), "influx");
        assert_eq!(config.filter.series, "FROM cpu");
        assert!(config.filter.time_start.is_some());
        assert_eq!(config.target.account_id.as_deref(), Some("42"));
        assert_eq!(config.options.effective_queue_capacity(), 32);
        assert_eq!(config.options.retry.max_retries, 5);
        assert_eq!(config.options.retry.initial_delay_ms, 500);
        assert!(config.validate().is_ok());

        let SourceConfig::Influx(influx) = &config.source else {
            panic!("expected influx source");
        };
        assert_eq!(influx.retention, "autogen");
        assert_eq!(influx.chunk_size, 5000);
    }

    #[test]
    fn test_config_yaml_parse_prometheus() {
        let yaml = r#"
source:
  type: prometheus
  snapshot: /prometheus/snapshots/20240101T000000Z
filter:
  label: job
  label_value: "node.*"
"#;
        let config: MigrationConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.source.kind(), "prometheus");
        assert_eq!(config.target.addr, "http://localhost:8428");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("migration.yaml");
        std::fs::write(&path, "source:\n  type: prometheus\n  snapshot: /tmp/snap\n").unwrap();

        let config = MigrationConfig::from_file(&path).unwrap();
        assert_eq!(config.source.kind(), "prometheus");

        assert!(MigrationConfig::from_file(&dir.path().join("missing.yaml")).is_err());
    }
}
