//! Source readers for the supported time-series stores.

pub mod influx;
pub mod prometheus;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

use crate::error::Result;
use crate::filter::Filter;
use crate::model::Chunk;

pub use influx::{InfluxConfig, InfluxReader};
pub use prometheus::{PrometheusConfig, PrometheusReader};

/// Lazily produced chunks of one read task.
///
/// An `Err` item is a chunk-level failure; the stream may continue after it.
pub type ChunkStream = BoxStream<'static, Result<Chunk>>;

/// Trait for source readers.
///
/// A reader first [`explore`](SourceReader::explore)s the source for
/// independent read tasks (a series, a block). Tasks can then be
/// [`read`](SourceReader::read) concurrently by any number of workers.
/// Implement this trait to add support for a new time-series store.
#[async_trait]
pub trait SourceReader: Send + Sync + 'static {
    /// One independent unit of extraction work.
    type Task: fmt::Display + Send + Sync + 'static;

    /// Get the source type name.
    fn source_type(&self) -> &'static str;

    /// Connect to the source and validate credentials.
    ///
    /// Failures here are fatal to the run.
    async fn connect(&mut self) -> Result<()>;

    /// Lists the read tasks matching `filter`.
    ///
    /// Rejects an invalid filter before any task is produced.
    async fn explore(&self, filter: &Filter) -> Result<Vec<Self::Task>>;

    /// Opens one task as a stream of chunks.
    async fn read(&self, task: &Self::Task, filter: &Filter) -> Result<ChunkStream>;

    /// Close the connection and cleanup resources.
    async fn close(&mut self) -> Result<()>;
}
