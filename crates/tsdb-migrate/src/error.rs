//! Error types for tsdb-migrate.
//!
//! The variants follow the failure taxonomy of a migration run: connection
//! failures abort the run, chunk and batch failures are recorded and skipped.

use thiserror::Error;

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while migrating time series.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid filter (bad time bounds, inverted window, dangling label value).
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Source is unreachable or rejected the connection.
    #[error("Source connection error: {0}")]
    SourceConnection(String),

    /// Target is unreachable or rejected the connection.
    #[error("Target connection error: {0}")]
    TargetConnection(String),

    /// Credentials were rejected by the source or the target.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A single chunk could not be retrieved or parsed.
    #[error("Failed to read chunk {chunk}: {reason}")]
    ChunkRead {
        /// Identifier of the read task the chunk belongs to.
        chunk: String,
        /// What went wrong.
        reason: String,
    },

    /// Transient write failure (timeout, throttling, 5xx).
    #[error("Retryable write failure: {0}")]
    WriteRetryable(String),

    /// Permanent write failure for one batch (malformed payload, rejection).
    #[error("Write rejected: {0}")]
    WriteFatal(String),

    /// Throttled by the remote side.
    #[error("Rate limit exceeded, retry after {0}s")]
    RateLimit(u64),

    /// One or more batches could not be written.
    #[error("{failed} batch(es) failed to import, last error: {last}")]
    Import {
        /// Number of failed batches.
        failed: u64,
        /// Message of the most recent failure.
        last: String,
    },

    /// Submission after the importer was closed or aborted.
    #[error("Importer is closed")]
    ImporterClosed,

    /// Operation interrupted by the cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML configuration parse error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Builds a [`Error::ChunkRead`] tagged with the task it belongs to.
    pub fn chunk_read(chunk: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::ChunkRead {
            chunk: chunk.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error must abort the whole run.
    ///
    /// Only unreachable or unauthenticated endpoints qualify; chunk and batch
    /// failures are isolated.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SourceConnection(_) | Self::TargetConnection(_) | Self::Authentication(_)
        )
    }
}
