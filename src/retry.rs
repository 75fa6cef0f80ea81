//! Retry logic with exponential backoff for transient driver errors.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::DriverError;

/// How driver calls are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Backoff multiplier.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Set the attempt limit.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the first delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the delay cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay after the failed attempt `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(64) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Why a retried call gave up.
#[derive(Debug)]
pub enum RetryError {
    /// The last driver error and how many calls were made.
    Exhausted {
        /// Calls made.
        attempts: u32,
        /// The last error.
        error: DriverError,
    },
    /// Cancelled during a backoff sleep.
    Cancelled {
        /// Calls made before cancellation.
        attempts: u32,
    },
}

/// Run `operation` until it succeeds, fails permanently, runs out of
/// attempts, or `cancel` fires during a backoff sleep.
///
/// Each call is bounded by `timeout` when given; an elapsed call counts as a
/// transient [`DriverError::DeadlineExceeded`]. On success, returns the value
/// and the number of calls made.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    timeout: Option<Duration>,
    cancel: &CancelToken,
    mut operation: F,
) -> Result<(T, u32), RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DriverError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result,
                Err(_) => Err(DriverError::DeadlineExceeded(format!(
                    "call did not finish within {:?}",
                    limit
                ))),
            },
            None => operation().await,
        };

        let error = match result {
            Ok(value) => return Ok((value, attempt)),
            Err(e) => e,
        };

        if !error.is_transient() || attempt >= max_attempts {
            return Err(RetryError::Exhausted {
                attempts: attempt,
                error,
            });
        }

        let delay = config.delay_for_attempt(attempt - 1);
        warn!(
            attempt,
            max_attempts,
            delay = ?delay,
            error = %error,
            "Transient driver error, retrying"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig::default()
            .with_max_attempts(max_attempts)
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(5))
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_transient_error_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let (value, attempts) = with_retry(&fast(3), None, &CancelToken::never(), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DriverError::Unavailable("503".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transient_error_exhausts_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = with_retry(&fast(2), None, &CancelToken::never(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(DriverError::Network("reset".into())) }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, RetryError::Exhausted { attempts: 2, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = with_retry(&fast(5), None, &CancelToken::never(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(DriverError::PermissionDenied("no".into())) }
        })
        .await
        .unwrap_err();

        match err {
            RetryError::Exhausted { attempts, error } => {
                assert_eq!(attempts, 1);
                assert!(matches!(error, DriverError::PermissionDenied(_)));
            },
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let (_, attempts) = with_retry(
            &fast(3),
            Some(Duration::from_millis(20)),
            &CancelToken::never(),
            || {
                let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
                async move {
                    if first {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok::<_, DriverError>(())
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_cancel_aborts_backoff() {
        let (handle, token) = cancel_pair();
        let config = RetryConfig::default()
            .with_max_attempts(5)
            .with_initial_delay(Duration::from_secs(30));

        let task = tokio::spawn(async move {
            with_retry(&config, None, &token, || async {
                Err::<(), _>(DriverError::Unavailable("down".into()))
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let err = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RetryError::Cancelled { attempts: 1 }));
    }
}
