// Migration tool - pedantic lints relaxed for CLI ergonomics
#![allow(clippy::pedantic)]

//! # tsdb-migrate
//!
//! `tsdb-migrate` is a CLI tool and library for migrating time series from
//! InfluxDB and Prometheus snapshots into VictoriaMetrics.
//!
//! ## Supported Sources
//!
//! | Source | Status | Notes |
//! |--------|--------|-------|
//! | InfluxDB 1.x | ✅ | HTTP query API, chunked responses |
//! | Prometheus | ✅ | Snapshot directory, TSDB index v1/v2, XOR chunks |
//!
//! ## Quick Start
//!
//! ```bash
//! # From InfluxDB
//! tsdb-migrate influx --influx-database telegraf --vm-addr http://localhost:8428
//!
//! # From a Prometheus snapshot
//! tsdb-migrate prometheus --prom-snapshot /prometheus/snapshots/20240101T000000Z
//!
//! # From a configuration file, dry run
//! tsdb-migrate --dry-run run --config migration.yaml
//! ```
//!
//! ## Configuration Example
//!
//! ```yaml
//! source:
//!   type: influx
//!   addr: http://localhost:8086
//!   database: telegraf
//!
//! filter:
//!   time_start: "2024-01-01T00:00:00Z"
//!
//! target:
//!   addr: http://localhost:8428
//!
//! options:
//!   concurrency: 4
//!   import_concurrency: 2
//!   batch_size: 200000
//! ```
//!
//! ## Pipeline
//!
//! A source reader explores the source for independent read tasks. Extraction
//! workers pull tasks on demand, stream their chunks through the
//! [`Transformer`], and submit the resulting series to the [`Importer`]. The
//! importer batches series and writes them with a fixed pool of workers,
//! retrying transient failures. Counters live in a shared [`RunStats`].

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod filter;
pub mod http;
pub mod importer;
pub mod model;
pub mod processor;
pub mod retry;
pub mod shutdown;
pub mod sources;
pub mod stats;
pub mod target;
pub mod transform;

pub use config::{MigrationConfig, MigrationOptions, SourceConfig};
pub use error::{Error, Result};
pub use filter::Filter;
pub use importer::{ImportQueue, Importer, ImporterConfig};
pub use model::{Chunk, Column, Label, Point, TimeSeries};
pub use processor::{
    run_migration, Processor, ProcessorOptions, RunOutcome, RunReport, RunState,
};
pub use retry::RetryConfig;
pub use sources::{ChunkStream, SourceReader};
pub use stats::{RunStats, RunSummary};
pub use target::{Batch, DiscardWriter, TargetWriter, VmConfig, VmWriter};
pub use transform::{TransformConfig, Transformer};
