//! Retry logic with exponential backoff for batch writes.
//!
//! Backoff sleeps observe the run's cancellation token so a stalled target
//! cannot hold up shutdown. A call already in flight is never interrupted.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Backoff policy for batch writes.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first call.
    pub max_retries: u32,
    /// Backoff before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on a single backoff.
    pub max_delay: Duration,
    /// Growth factor between consecutive backoffs.
    pub backoff_multiplier: f64,
    /// Spread backoffs of concurrent workers apart.
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Policy that gives up after the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Backoff before retry number `attempt` (1-based); zero for the first call.
    ///
    /// Grows geometrically from `initial_delay`, is capped at `max_delay`,
    /// and gains up to a quarter on top when jitter is enabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(exponent) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };
        let growth = self
            .backoff_multiplier
            .powi(i32::try_from(exponent).unwrap_or(i32::MAX));
        let secs = (self.initial_delay.as_secs_f64() * growth).min(self.max_delay.as_secs_f64());
        let spread = if self.add_jitter { jitter_fraction() / 4.0 } else { 0.0 };
        Duration::try_from_secs_f64(secs * (1.0 + spread)).unwrap_or(self.max_delay)
    }

    /// Backoff after `error`, stretched to a server-provided retry hint.
    fn delay_after(&self, attempt: u32, error: &Error) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        match error {
            Error::RateLimit(secs) => delay.max(Duration::from_secs(*secs)),
            _ => delay,
        }
    }
}

/// Serializable form of [`RetryConfig`] used in configuration files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Backoff cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor between attempts.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(s: &RetrySettings) -> Self {
        Self {
            max_retries: s.max_retries,
            initial_delay: Duration::from_millis(s.initial_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            backoff_multiplier: s.backoff_multiplier,
            add_jitter: true,
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Value in `[0, 1)` drawn from the std hasher's random keys.
fn jitter_fraction() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(u64::from(std::process::id()));
    (hasher.finish() >> 11) as f64 / (1u64 << 53) as f64
}

/// Whether a failed write may succeed if sent again.
///
/// Throttling, 5xx-class responses and transport timeouts or resets qualify.
/// Anything the target rejected on content or credentials does not.
pub fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::WriteRetryable(_) | Error::RateLimit(_) | Error::Io(_) => true,
        Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        _ => false,
    }
}

/// Runs `operation` until it succeeds, fails permanently, or the retry
/// budget runs out; returns the last error in the latter two cases.
///
/// `cancel` only interrupts the backoff sleep, yielding
/// [`Error::Cancelled`]. A call already in flight always completes.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("{} succeeded on retry {}", name, attempt);
                }
                return Ok(value);
            }
            Err(e) if attempt < config.max_retries && is_retryable_error(&e) => e,
            Err(e) => return Err(e),
        };

        attempt += 1;
        let delay = config.delay_after(attempt, &error);
        warn!(
            "{} failed ({}), retry {}/{} in {:?}",
            name, error, attempt, config.max_retries, delay
        );
        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();

        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.backoff_multiplier, 2.0);
        assert!(config.add_jitter);
    }

    #[test]
    fn test_retry_settings_convert() {
        let settings = RetrySettings {
            max_retries: 7,
            initial_delay_ms: 10,
            max_delay_ms: 100,
            backoff_multiplier: 3.0,
        };

        let config = RetryConfig::from(&settings);

        assert_eq!(config.max_retries, 7);
        assert_eq!(config.initial_delay, Duration::from_millis(10));
        assert_eq!(config.max_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_delay_for_attempt_exponential() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(100),
            add_jitter: false,
            ..Default::default()
        };

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(10),
            backoff_multiplier: 10.0,
            max_delay: Duration::from_secs(30),
            add_jitter: false,
            ..Default::default()
        };

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(4),
            ..Default::default()
        };
        for attempt in 1..20 {
            let delay = config.delay_for_attempt(attempt);
            assert!(delay >= Duration::from_secs(4));
            assert!(delay <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_rate_limit_hint_extends_backoff() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            add_jitter: false,
            ..Default::default()
        };
        assert_eq!(
            config.delay_after(1, &Error::RateLimit(3)),
            Duration::from_secs(3)
        );
        assert_eq!(
            config.delay_after(1, &Error::WriteRetryable("503".into())),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable_error(&Error::WriteRetryable("503".into())));
        assert!(is_retryable_error(&Error::RateLimit(1)));
        assert!(!is_retryable_error(&Error::WriteFatal("400".into())));
        assert!(!is_retryable_error(&Error::Authentication("401".into())));
    }

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            add_jitter: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_with_retry_success_after_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_retry(&fast_config(3), &CancellationToken::new(), "write", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::WriteRetryable("HTTP 503".into()))
                } else {
                    Ok::<_, Error>(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = with_retry(&fast_config(2), &CancellationToken::new(), "write", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::WriteRetryable("HTTP 500".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::WriteRetryable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3); // 1 initial + 2 retries
    }

    #[tokio::test]
    async fn test_with_retry_fatal_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = with_retry(&fast_config(5), &CancellationToken::new(), "write", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::WriteFatal("HTTP 400".into()))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_cancelled_during_backoff() {
        let config = RetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_secs(60),
            add_jitter: false,
            ..Default::default()
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> = with_retry(&config, &cancel, "write", || async {
            Err(Error::WriteRetryable("HTTP 503".into()))
        })
        .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
