//! Retry with exponential backoff.
//!
//! Used around SQLite writes (log appends, graph persistence) and delta
//! publication.
//!
//! ```rust,ignore
//! use tracegraph_core::retry::{RetryPolicy, with_retry};
//!
//! let ids = with_retry(&RetryPolicy::db_write(), || log.append_batch(batch.clone())).await?;
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::error::Result;

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub backoff_factor: f64,
    /// Random jitter range as a fraction (0.1 = ±10%).
    pub jitter_percent: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Policy for database writes: 5 attempts, 50ms initial.
    #[must_use]
    pub fn db_write() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(5),
        }
    }

    /// Policy for delta publication: 2 attempts, 10ms initial. A failed
    /// publish is retried by the next frame anyway.
    #[must_use]
    pub fn publish() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: Some(2),
        }
    }

    /// Delay before retry number `attempt` (0-indexed).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    #[allow(clippy::cast_possible_wrap)]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 && base_ms > 0.0 {
            let range = base_ms * self.jitter_percent;
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_millis((base_ms + jitter).max(0.0) as u64)
    }
}

/// Run `operation` until it succeeds, fails permanently, or the policy's
/// attempts are exhausted. Only [`crate::Error::is_transient`] failures are retried.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(retries = attempt, "operation succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) => {
                attempt += 1;

                if !e.is_transient() {
                    return Err(e);
                }
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    warn!(
                        attempt,
                        error = %e,
                        elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                        "operation failed after all retry attempts"
                    );
                    return Err(e);
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, Error, StorageError};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_factor: 2.0,
            jitter_percent: 0.0,
            max_attempts: Some(max_attempts),
        }
    }

    fn busy() -> Error {
        Error::Storage(StorageError::Busy("database is locked".into()))
    }

    #[test]
    fn delay_calculation_with_backoff() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter_percent: 0.0,
            max_attempts: Some(5),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy {
            max_delay: Duration::from_millis(500),
            jitter_percent: 0.0,
            ..RetryPolicy::db_write()
        };
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1000), Duration::from_millis(500));
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn jitter_within_range() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 1.0,
            jitter_percent: 0.1,
            max_attempts: Some(5),
        };
        for _ in 0..100 {
            let delay_ms = policy.delay_for_attempt(0).as_millis() as f64;
            assert!((900.0..=1100.0).contains(&delay_ms), "delay out of range: {delay_ms}");
        }
    }

    #[test]
    fn presets() {
        let db = RetryPolicy::db_write();
        assert_eq!(db.max_attempts, Some(5));
        assert_eq!(db.initial_delay, Duration::from_millis(50));
        let publish = RetryPolicy::publish();
        assert_eq!(publish.max_attempts, Some(2));
        assert!(publish.max_delay < db.max_delay);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = with_retry(&fast(5), || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(busy())
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(busy()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = with_retry(&fast(5), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ConfigError::ValidationError("fps".into()).into())
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
