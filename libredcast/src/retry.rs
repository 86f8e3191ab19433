//! Bounded retry with exponential backoff for upstream calls
//!
//! Wraps any Reddit API operation, retrying transient failures and
//! surfacing fatal ones immediately. The same policy governs reads and
//! writes.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::error::ApiError;

/// Maximum random jitter added to each backoff delay
const JITTER_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Run an operation, retrying classified-transient failures.
    ///
    /// The operation is attempted at most `max_retries + 1` times. Fatal
    /// errors (auth, validation, quota exhaustion, non-429 rejections) short-
    /// circuit on the first occurrence. After exhausting retries the last
    /// error is returned unmodified so the operator sees the true upstream
    /// cause.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt: u32 = 0;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        "Transient upstream failure (attempt {}/{}): {}. Retrying in {:?}",
                        attempt + 1,
                        self.max_retries + 1,
                        e,
                        delay
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Delay before the next attempt: `base * 2^attempt` plus up to one
    /// second of random jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponential = self.base_delay.as_millis() as u64 * 2u64.pow(attempt);
        let jitter = rand::thread_rng().gen_range(0..JITTER_MS);
        Duration::from_millis(exponential + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result = fast_policy()
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ApiError>(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result = fast_policy()
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(ApiError::Transient("503".to_string()))
                    } else {
                        Ok("posted")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "posted");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_bound_and_verbatim_last_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result: Result<(), ApiError> = fast_policy()
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::Transient(format!("server error on attempt {}", n)))
                }
            })
            .await;

        // max_retries + 1 total attempts
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        match result {
            Err(ApiError::Transient(msg)) => {
                // The final error, not a wrapper and not an earlier one
                assert_eq!(msg, "server error on attempt 3");
            }
            other => panic!("expected transient error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_quota_exhausted_short_circuits() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result: Result<(), ApiError> = fast_policy()
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::QuotaExhausted("402 payment required".to_string()))
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ApiError::QuotaExhausted(_))));
    }

    #[tokio::test]
    async fn test_auth_error_never_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result: Result<(), ApiError> = fast_policy()
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::Auth("token revoked".to_string()))
                }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ApiError::Auth(_))));
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result = fast_policy()
            .run(|| {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        Err(ApiError::RateLimit("429".to_string()))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_grows_exponentially_with_bounded_jitter() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1000));

        for attempt in 0..3 {
            let expected_base = 1000 * 2u64.pow(attempt);
            let delay = policy.backoff_delay(attempt).as_millis() as u64;
            assert!(delay >= expected_base);
            assert!(delay < expected_base + JITTER_MS);
        }
    }
}
