//! tsdb-migrate CLI
//!
//! CLI tool for migrating time series from InfluxDB and Prometheus
//! snapshots into VictoriaMetrics.

// CLI tool - relax pedantic lints for ergonomics
#![allow(clippy::pedantic)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use console::style;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use tsdb_migrate::config::{MigrationConfig, MigrationOptions, SourceConfig};
use tsdb_migrate::sources::{InfluxConfig, PrometheusConfig};
use tsdb_migrate::{shutdown, Filter, RunOutcome, RunReport, VmConfig};

#[derive(Parser)]
#[command(name = "tsdb-migrate")]
#[command(version)]
#[command(about = "Migrate time series from InfluxDB or Prometheus into VictoriaMetrics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Hide the progress bar
    #[arg(long, global = true, env = "SILENT")]
    silent: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Dry run mode (read and transform, don't write to VictoriaMetrics)
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate from InfluxDB 1.x
    Influx {
        #[command(flatten)]
        source: InfluxArgs,
        #[command(flatten)]
        target: VmArgs,
        #[command(flatten)]
        perf: PerfArgs,
    },

    /// Migrate from a Prometheus snapshot
    Prometheus {
        #[command(flatten)]
        source: PromArgs,
        #[command(flatten)]
        target: VmArgs,
        #[command(flatten)]
        perf: PerfArgs,
    },

    /// Run migration from config file
    Run {
        /// Configuration file path
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },

    /// Validate configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },

    /// Generate example configuration
    Init {
        /// Source type (influx, prometheus)
        #[arg(short, long)]
        source: String,

        /// Output file path
        #[arg(short, long, default_value = "migration.yaml")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct InfluxArgs {
    /// InfluxDB server address
    #[arg(long, env = "INFLUX_ADDR", default_value = "http://localhost:8086")]
    influx_addr: String,

    /// InfluxDB user
    #[arg(long, env = "INFLUX_USERNAME")]
    influx_user: Option<String>,

    /// InfluxDB user password
    #[arg(long, env = "INFLUX_PASSWORD", hide_env_values = true)]
    influx_password: Option<String>,

    /// InfluxDB database to migrate
    #[arg(long, env = "INFLUX_DATABASE")]
    influx_database: String,

    /// InfluxDB retention policy
    #[arg(long, env = "INFLUX_RETENTION_POLICY", default_value = "autogen")]
    influx_retention_policy: String,

    /// Rows per page of the chunked query response
    #[arg(long, env = "INFLUX_CHUNK_SIZE", default_value_t = 10_000)]
    influx_chunk_size: usize,

    /// Series selector appended to SHOW SERIES, e.g. "FROM cpu WHERE host = 'a'"
    #[arg(long, env = "INFLUX_FILTER_SERIES", default_value = "")]
    influx_filter_series: String,

    /// Inclusive lower time bound (RFC3339)
    #[arg(long, env = "INFLUX_FILTER_TIME_START", default_value = "")]
    influx_filter_time_start: String,

    /// Inclusive upper time bound (RFC3339)
    #[arg(long, env = "INFLUX_FILTER_TIME_END", default_value = "")]
    influx_filter_time_end: String,

    /// Do not attach the `db` label to migrated series
    #[arg(long, env = "INFLUX_SKIP_DATABASE_LABEL")]
    influx_skip_database_label: bool,

    /// Separator between measurement and field in metric names
    #[arg(long, env = "INFLUX_MEASUREMENT_FIELD_SEPARATOR", default_value = "_")]
    influx_measurement_field_separator: String,
}

#[derive(Args)]
struct PromArgs {
    /// Path to a Prometheus snapshot directory
    #[arg(long, env = "PROM_SNAPSHOT")]
    prom_snapshot: PathBuf,

    /// Inclusive lower time bound (RFC3339)
    #[arg(long, env = "PROM_FILTER_TIME_START", default_value = "")]
    prom_filter_time_start: String,

    /// Inclusive upper time bound (RFC3339)
    #[arg(long, env = "PROM_FILTER_TIME_END", default_value = "")]
    prom_filter_time_end: String,

    /// Label name to filter on
    #[arg(long, env = "PROM_FILTER_LABEL", default_value = "")]
    prom_filter_label: String,

    /// Regular expression the label value must fully match
    #[arg(long, env = "PROM_FILTER_LABEL_VALUE", default_value = "")]
    prom_filter_label_value: String,
}

#[derive(Args)]
struct VmArgs {
    /// VictoriaMetrics address (single-node or vminsert)
    #[arg(long, env = "VM_ADDR", default_value = "http://localhost:8428")]
    vm_addr: String,

    /// VictoriaMetrics user
    #[arg(long, env = "VM_USERNAME")]
    vm_user: Option<String>,

    /// VictoriaMetrics user password
    #[arg(long, env = "VM_PASSWORD", hide_env_values = true)]
    vm_password: Option<String>,

    /// Tenant for the cluster version (`accountID` or `accountID:projectID`)
    #[arg(long, env = "VM_ACCOUNT_ID")]
    vm_account_id: Option<String>,

    /// Gzip request bodies
    #[arg(long, env = "VM_COMPRESS", default_value_t = true, action = clap::ArgAction::Set)]
    vm_compress: bool,

    /// Extra label added to every series (`name=value`), repeatable
    #[arg(long = "vm-extra-label", env = "VM_EXTRA_LABEL", value_delimiter = ',')]
    vm_extra_labels: Vec<String>,
}

#[derive(Args)]
struct PerfArgs {
    /// Number of extraction workers
    #[arg(long, env = "CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Number of concurrent writes to VictoriaMetrics
    #[arg(long, env = "VM_CONCURRENCY", default_value_t = 2)]
    vm_concurrency: usize,

    /// Points per import batch
    #[arg(long, env = "VM_BATCH_SIZE", default_value_t = 200_000)]
    vm_batch_size: usize,

    /// Significant figures to keep (0 disables rounding)
    #[arg(long, env = "VM_SIGNIFICANT_FIGURES", default_value_t = 0)]
    vm_significant_figures: u32,
}

impl PerfArgs {
    fn options(&self, silent: bool, dry_run: bool) -> MigrationOptions {
        MigrationOptions {
            concurrency: self.concurrency,
            import_concurrency: self.vm_concurrency,
            batch_size: self.vm_batch_size,
            significant_figures: self.vm_significant_figures,
            silent,
            dry_run,
            ..Default::default()
        }
    }
}

impl VmArgs {
    fn config(&self) -> VmConfig {
        VmConfig {
            addr: self.vm_addr.clone(),
            user: self.vm_user.clone(),
            password: self.vm_password.clone(),
            account_id: self.vm_account_id.clone(),
            compress: self.vm_compress,
        }
    }

    fn extra_labels(&self) -> anyhow::Result<BTreeMap<String, String>> {
        let mut labels = BTreeMap::new();
        for raw in &self.vm_extra_labels {
            let Some((name, value)) = raw.split_once('=') else {
                anyhow::bail!("extra label {raw:?} must be in name=value form");
            };
            labels.insert(name.trim().to_string(), value.trim().to_string());
        }
        Ok(labels)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {e}");
    }

    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("{} {:#}", style("✗").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = match cli.command {
        Commands::Influx {
            source,
            target,
            perf,
        } => {
            let filter = Filter::parse(
                &source.influx_filter_series,
                &source.influx_filter_time_start,
                &source.influx_filter_time_end,
                "",
                "",
            )?;
            let mut options = perf.options(cli.silent, cli.dry_run);
            options.measurement_field_separator = source.influx_measurement_field_separator;
            options.extra_labels = target.extra_labels()?;
            MigrationConfig {
                source: SourceConfig::Influx(InfluxConfig {
                    addr: source.influx_addr,
                    user: source.influx_user,
                    password: source.influx_password,
                    database: source.influx_database,
                    retention: source.influx_retention_policy,
                    chunk_size: source.influx_chunk_size,
                    skip_database_label: source.influx_skip_database_label,
                }),
                filter,
                target: target.config(),
                options,
            }
        }
        Commands::Prometheus {
            source,
            target,
            perf,
        } => {
            let filter = Filter::parse(
                "",
                &source.prom_filter_time_start,
                &source.prom_filter_time_end,
                &source.prom_filter_label,
                &source.prom_filter_label_value,
            )?;
            let mut options = perf.options(cli.silent, cli.dry_run);
            options.extra_labels = target.extra_labels()?;
            MigrationConfig {
                source: SourceConfig::Prometheus(PrometheusConfig {
                    snapshot: source.prom_snapshot,
                }),
                filter,
                target: target.config(),
                options,
            }
        }
        Commands::Run { config } => {
            info!("Loading configuration from {:?}", config);
            let mut config = MigrationConfig::from_file(&config)?;
            config.options.dry_run |= cli.dry_run;
            config.options.silent |= cli.silent;
            config
        }
        Commands::Validate { config } => {
            validate_config(&config)?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Init { source, output } => {
            generate_config(&source, &output)?;
            return Ok(ExitCode::SUCCESS);
        }
    };

    migrate(&config).await?;
    Ok(ExitCode::SUCCESS)
}

async fn migrate(config: &MigrationConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let listener = shutdown::listen_for_shutdown(cancel.clone());

    info!(
        "Starting {} migration{}",
        config.source.kind(),
        if config.options.dry_run {
            " (dry run)"
        } else {
            ""
        }
    );
    let result = tsdb_migrate::run_migration(config, cancel.clone()).await;
    listener.abort();

    let report = result?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &RunReport) {
    let summary = &report.summary;
    let headline = match report.outcome {
        RunOutcome::Completed => style("✅ Migration Complete!").green().bold(),
        RunOutcome::CompletedWithErrors => {
            style("⚠️  Migration completed with errors").yellow().bold()
        }
        RunOutcome::Cancelled => style("⏹  Migration cancelled (partial)").yellow().bold(),
    };

    println!();
    println!("{}", headline);
    println!(
        "   Tasks:      {}/{}",
        summary.tasks_done, summary.tasks_total
    );
    println!(
        "   Chunks:     {} ({} failed)",
        summary.chunks_read, summary.chunk_errors
    );
    println!("   Submitted:  {}", summary.points_submitted);
    println!("   Written:    {}", summary.points_written);
    println!(
        "   Failed:     {} points in {} batches",
        summary.points_failed, summary.batches_failed
    );
    println!("   Throughput: {:.0} points/sec", summary.throughput());
    if let Some(last) = &summary.last_error {
        println!("   Last error: {}", style(last).red());
    }
    println!("Total time: {:.2}s", summary.duration.as_secs_f64());
}

fn validate_config(config_path: &Path) -> anyhow::Result<()> {
    info!("Validating configuration from {:?}", config_path);

    let config = MigrationConfig::from_file(config_path)?;
    config.validate()?;

    println!("✅ Configuration is valid!");
    println!("   Source: {}", config.source.kind());
    println!("   Target: {}", config.target.addr);
    println!(
        "   Workers: {} extraction, {} import",
        config.options.concurrency, config.options.import_concurrency
    );
    println!("   Batch size: {}", config.options.batch_size);

    Ok(())
}

fn generate_config(source: &str, output: &Path) -> anyhow::Result<()> {
    let template = match source.to_lowercase().as_str() {
        "influx" | "influxdb" => INFLUX_TEMPLATE,
        "prometheus" | "prom" => PROMETHEUS_TEMPLATE,
        _ => anyhow::bail!("unknown source type {source:?}, supported sources: influx, prometheus"),
    };

    std::fs::write(output, template)?;
    println!("✅ Generated configuration: {:?}", output);
    println!(
        "   Edit the file and run: tsdb-migrate run --config {:?}",
        output
    );

    Ok(())
}

const INFLUX_TEMPLATE: &str = r#"# tsdb-migrate configuration - InfluxDB 1.x source
source:
  type: influx
  addr: http://localhost:8086
  database: telegraf
  retention: autogen
  chunk_size: 10000
  # user: admin
  # password: secret
  # skip_database_label: false

filter: {}
  # series: "FROM cpu WHERE host = 'web-1'"
  # time_start: "2024-01-01T00:00:00Z"
  # time_end: "2024-02-01T00:00:00Z"

target:
  addr: http://localhost:8428
  compress: true
  # account_id: "0"  # vminsert tenant for the cluster version

options:
  concurrency: 4
  import_concurrency: 2
  batch_size: 200000
  significant_figures: 0  # 0 keeps full precision
  measurement_field_separator: "_"
  retry:
    max_retries: 3
    initial_delay_ms: 500
  dry_run: false
"#;

const PROMETHEUS_TEMPLATE: &str = r#"# tsdb-migrate configuration - Prometheus snapshot source
source:
  type: prometheus
  snapshot: /prometheus/snapshots/20240101T000000Z-0123456789abcdef

filter: {}
  # label: job
  # label_value: "node.*"  # must match the whole value
  # time_start: "2024-01-01T00:00:00Z"
  # time_end: "2024-02-01T00:00:00Z"

target:
  addr: http://localhost:8428
  compress: true

options:
  concurrency: 4
  import_concurrency: 2
  batch_size: 200000
  dry_run: false
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_templates_parse_and_validate() {
        for template in [INFLUX_TEMPLATE, PROMETHEUS_TEMPLATE] {
            let config: MigrationConfig = serde_yaml::from_str(template).unwrap();
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_parse_influx_flags() {
        let cli = Cli::try_parse_from([
            "tsdb-migrate",
            "--silent",
            "influx",
            "--influx-database",
            "telegraf",
            "--influx-filter-time-start",
            "2024-01-01T00:00:00Z",
            "--vm-concurrency",
            "8",
            "--vm-compress",
            "false",
            "--vm-extra-label",
            "source=legacy",
        ])
        .unwrap();
        assert!(cli.silent);
        let Commands::Influx {
            source,
            target,
            perf,
        } = cli.command
        else {
            panic!("expected influx command");
        };
        assert_eq!(source.influx_database, "telegraf");
        assert_eq!(source.influx_chunk_size, 10_000);
        assert_eq!(perf.vm_concurrency, 8);
        assert!(!target.vm_compress);
        assert_eq!(target.extra_labels().unwrap()["source"], "legacy");
    }

    #[test]
    fn test_extra_label_requires_equals() {
        let cli = Cli::try_parse_from([
            "tsdb-migrate",
            "prometheus",
            "--prom-snapshot",
            "/tmp/snap",
            "--vm-extra-label",
            "broken",
        ])
        .unwrap();
        let Commands::Prometheus { target, .. } = cli.command else {
            panic!("expected prometheus command");
        };
        assert!(target.extra_labels().is_err());
    }

    #[test]
    fn test_generate_config_rejects_unknown_source() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("migration.yaml");
        assert!(generate_config("qdrant", &output).is_err());

        generate_config("prometheus", &output).unwrap();
        let written = MigrationConfig::from_file(&output).unwrap();
        assert_eq!(written.source.kind(), "prometheus");
    }
}
