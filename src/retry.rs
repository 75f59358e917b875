//! Retry Module
//!
//! Exponential backoff with jitter for operations that fail with a
//! recoverable error (`LeaseTimeout`, `RemoteUnavailable`, ...).

use crate::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry behaviour for recoverable failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 3)
    pub max_retries: u32,
    /// Backoff before the first retry (default: 100ms)
    #[serde(with = "crate::config::duration_serde")]
    pub initial_backoff: Duration,
    /// Upper bound for a single backoff (default: 5s)
    #[serde(with = "crate::config::duration_serde")]
    pub max_backoff: Duration,
    /// Jitter factor (0.0 to 1.0, default: 0.25 for ±25%)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            jitter_factor: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, initial_backoff: Duration, max_backoff: Duration, jitter_factor: f64) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Backoff for a given attempt: exponential growth, capped, with jitter applied
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base_backoff_ms = self.initial_backoff.as_millis() as u64;
        let exponential_factor = 1u64 << attempt.min(10); // Cap at 2^10 to prevent overflow
        let exponential_backoff_ms = base_backoff_ms.saturating_mul(exponential_factor);

        let capped_backoff_ms = exponential_backoff_ms.min(self.max_backoff.as_millis() as u64);

        let jitter_range = (capped_backoff_ms as f64 * self.jitter_factor) as u64;
        let jitter = if jitter_range > 0 {
            let random_jitter = fastrand::u64(0..=jitter_range * 2);
            random_jitter as i64 - jitter_range as i64
        } else {
            0
        };

        let final_backoff_ms = (capped_backoff_ms as i64 + jitter).max(1) as u64;
        Duration::from_millis(final_backoff_ms)
    }
}

/// Run `operation` until it succeeds, fails with a non-recoverable error, or
/// the retry budget is spent. `what` names the operation in log lines.
pub async fn retry_recoverable<T, F, Fut>(config: &RetryConfig, what: &str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_if(config, what, ProxyError::is_recoverable, operation).await
}

/// Like `retry_recoverable`, retrying only errors accepted by `should_retry`
pub async fn retry_if<T, F, Fut, P>(config: &RetryConfig, what: &str, should_retry: P, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&ProxyError) -> bool,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if should_retry(&e) && attempt < config.max_retries => {
                let backoff = config.calculate_backoff(attempt);
                debug!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what,
                    attempt + 1,
                    config.max_retries + 1,
                    e,
                    backoff
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                if should_retry(&e) {
                    warn!("{} failed after {} attempts: {}", what, attempt + 1, e);
                }
                return Err(e);
            }
        }
    }
}

/// Transport-level failures worth another attempt
pub fn is_transport_failure(err: &ProxyError) -> bool {
    matches!(err, ProxyError::RemoteUnavailable(_) | ProxyError::TimeoutError(_))
}

/// Treat a transport failure as the remote store being unreachable
pub fn unavailable(context: &str, err: impl std::fmt::Display) -> ProxyError {
    ProxyError::RemoteUnavailable(format!("{}: {}", context, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig::new(5, Duration::from_millis(100), Duration::from_millis(500), 0.0);
        assert_eq!(config.calculate_backoff(0), Duration::from_millis(100));
        assert_eq!(config.calculate_backoff(1), Duration::from_millis(200));
        assert_eq!(config.calculate_backoff(2), Duration::from_millis(400));
        assert_eq!(config.calculate_backoff(3), Duration::from_millis(500));
        assert_eq!(config.calculate_backoff(30), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_jitter_stays_in_range() {
        let config = RetryConfig::new(5, Duration::from_millis(100), Duration::from_secs(1), 0.25);
        for _ in 0..100 {
            let backoff = config.calculate_backoff(0).as_millis();
            assert!((75..=125).contains(&backoff), "backoff {} out of range", backoff);
        }
    }

    #[tokio::test]
    async fn test_retry_stops_on_success() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(2), 0.0);

        let result = retry_recoverable(&config, "lease", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProxyError::LeaseTimeout("A".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_conflicts() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(2), 0.0);

        let result: Result<()> = retry_recoverable(&config, "commit", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(ProxyError::Conflict {
                    name: "A".to_string(),
                    expected: 1,
                    current: 2,
                })
            }
        })
        .await;

        assert!(matches!(result, Err(ProxyError::Conflict { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_if_leaves_lease_timeouts_alone() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(2), 0.0);

        let result: Result<()> = retry_if(&config, "lease", is_transport_failure, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProxyError::LeaseTimeout("A".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(ProxyError::LeaseTimeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
