//! VictoriaMetrics writer using the JSON line import API.

use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::http::{connection_error, create_http_client, join_url, write_error};
use crate::target::{Batch, TargetWriter};

/// Configuration for the VictoriaMetrics target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    /// VictoriaMetrics address (single-node or vminsert), e.g. `http://localhost:8428`.
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Optional username for Basic auth.
    #[serde(default)]
    pub user: Option<String>,
    /// Optional password for Basic auth.
    #[serde(default)]
    pub password: Option<String>,
    /// Tenant for the cluster version (`accountID` or `accountID:projectID`).
    #[serde(default)]
    pub account_id: Option<String>,
    /// Gzip request bodies.
    #[serde(default = "default_compress")]
    pub compress: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            user: None,
            password: None,
            account_id: None,
            compress: default_compress(),
        }
    }
}

fn default_addr() -> String {
    "http://localhost:8428".to_string()
}

fn default_compress() -> bool {
    true
}

/// Writes batches to VictoriaMetrics `/api/v1/import`.
pub struct VmWriter {
    config: VmConfig,
    client: Client,
    import_url: String,
}

impl VmWriter {
    /// Creates a writer with a configured HTTP client.
    pub fn new(config: VmConfig) -> Self {
        let import_url = import_url(&config);
        Self {
            config,
            client: create_http_client(),
            import_url,
        }
    }

    /// The endpoint batches are posted to.
    #[must_use]
    pub fn import_url(&self) -> &str {
        &self.import_url
    }

    /// Applies credentials uniformly to every call.
    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.config.user {
            Some(user) => req.basic_auth(user, self.config.password.as_deref()),
            None => req,
        }
    }
}

fn import_url(config: &VmConfig) -> String {
    match config.account_id.as_deref().filter(|a| !a.is_empty()) {
        Some(account) => join_url(
            &config.addr,
            &format!("insert/{}/prometheus/api/v1/import", account),
        ),
        None => join_url(&config.addr, "api/v1/import"),
    }
}

#[async_trait]
impl TargetWriter for VmWriter {
    fn target_type(&self) -> &'static str {
        "victoriametrics"
    }

    async fn ping(&self) -> Result<()> {
        let url = join_url(&self.config.addr, "health");
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| Error::TargetConnection(format!("VictoriaMetrics unreachable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(connection_error(status, &body, "VictoriaMetrics", true));
        }
        Ok(())
    }

    async fn write(&self, batch: &Batch) -> Result<()> {
        let body = batch.encode(self.config.compress)?;
        debug!(
            "Writing batch of {} points ({} bytes) to {}",
            batch.len(),
            body.len(),
            self.import_url
        );

        let mut req = self
            .authorize(self.client.post(&self.import_url))
            .header(CONTENT_TYPE, "application/stream+json");
        if self.config.compress {
            req = req.header(CONTENT_ENCODING, "gzip");
        }

        let response = req.body(body).send().await.map_err(|e| {
            if e.is_builder() {
                Error::WriteFatal(format!("invalid import request: {}", e))
            } else {
                Error::WriteRetryable(format!("import request failed: {}", e))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(1);
            return Err(Error::RateLimit(wait));
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(write_error(status, &body, "VictoriaMetrics"))
    }
}

#[cfg(test)]
#[path = "victoria_tests.rs"]
mod tests;
