//! HTTP plumbing shared by the InfluxDB reader and the VictoriaMetrics writer.

use crate::error::{Error, Result};
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Default HTTP timeout for a single request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Creates a configured HTTP client with timeout.
#[must_use]
pub fn create_http_client() -> Client {
    Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Creates a client without a total request timeout, for long streamed
/// responses. Only the connect phase is bounded.
#[must_use]
pub fn create_streaming_client() -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Validates an endpoint address.
pub fn validate_url(url: &str) -> Result<()> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(Error::Config(format!(
            "Invalid URL scheme in '{}'. Allowed: http, https",
            url
        )));
    }

    if url.len() < 10 {
        return Err(Error::Config(format!("Invalid URL format: {}", url)));
    }

    Ok(())
}

/// Joins a base address and a path without doubling slashes.
#[must_use]
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Maps a failed response status to a connection-phase error.
pub fn connection_error(status: StatusCode, body: &str, endpoint: &str, target: bool) -> Error {
    match status.as_u16() {
        401 | 403 => Error::Authentication(format!("{} auth failed: {}", endpoint, body)),
        _ if target => Error::TargetConnection(format!("{} error {}: {}", endpoint, status, body)),
        _ => Error::SourceConnection(format!("{} error {}: {}", endpoint, status, body)),
    }
}

/// Maps a failed write response to the write-failure taxonomy.
pub fn write_error(status: StatusCode, body: &str, endpoint: &str) -> Error {
    match status.as_u16() {
        401 | 403 => Error::Authentication(format!("{} auth failed: {}", endpoint, body)),
        429 => Error::RateLimit(1),
        408 | 425 | 500..=599 => {
            Error::WriteRetryable(format!("{} error {}: {}", endpoint, status, body))
        }
        _ => Error::WriteFatal(format!("{} error {}: {}", endpoint, status, body)),
    }
}
