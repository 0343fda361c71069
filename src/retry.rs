//! Exponential backoff with jitter for upstream calls.
//!
//! Delay before retry `n` (0-based) is
//! `min(2^n * base_delay + uniform(0..=max_jitter), max_delay)`.
//! The final error is returned wrapped in [`RetryError`] with the number of
//! attempts made.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

/// Retry tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter added to each delay
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    /// Disable jitter (deterministic delays)
    pub fn without_jitter(mut self) -> Self {
        self.max_jitter = Duration::ZERO;
        self
    }

    /// Delay before the given retry (0-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        let backoff = self.base_delay.saturating_mul(factor);

        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };

        backoff.saturating_add(jitter).min(self.max_delay)
    }
}

/// The last error of an exhausted retry loop
#[derive(Debug, Error)]
#[error("operation failed after {attempts} attempt(s): {last_error}")]
pub struct RetryError<E> {
    /// Total attempts made, including the first
    pub attempts: u32,
    pub last_error: E,
}

impl<E> RetryError<E> {
    /// Unwrap the underlying error
    pub fn into_inner(self) -> E {
        self.last_error
    }
}

/// Runs fallible async operations under a [`RetryPolicy`]
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retry on any error
    pub async fn run<T, E, F, Fut>(&self, operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.run_if(operation, |_| true).await
    }

    /// Retry only while `should_retry` accepts the error.
    ///
    /// A rejected error ends the loop immediately.
    pub async fn run_if<T, E, F, Fut, P>(
        &self,
        mut operation: F,
        should_retry: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempts = attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let retries_used = attempt - 1;
                    if retries_used >= self.policy.max_retries || !should_retry(&e) {
                        warn!(attempts = attempt, error = %e, "Operation failed, giving up");
                        return Err(RetryError {
                            attempts: attempt,
                            last_error: e,
                        });
                    }

                    let delay = self.policy.delay(retries_used);
                    warn!(
                        attempt,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Retry `operation` up to `max_retries` times after the first attempt
pub async fn with_retry<T, E, F, Fut>(
    operation: F,
    max_retries: u32,
    base_delay: Duration,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    RetryExecutor::new(RetryPolicy::new(max_retries, base_delay))
        .run(operation)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_grows_exponentially() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100)).without_jitter();
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(20, Duration::from_millis(1000));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
        assert_eq!(policy.delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        for _ in 0..100 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(1200));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<u32, RetryError<String>> = with_retry(
            || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(format!("transient {n}"))
                    } else {
                        Ok(n)
                    }
                }
            },
            3,
            Duration::from_millis(10),
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_error_carries_attempt_count() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = with_retry(
            || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("upstream down")
                }
            },
            2,
            Duration::from_millis(10),
        )
        .await
        .unwrap_err();

        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_error, "upstream down");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("3 attempt"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let executor = RetryExecutor::new(RetryPolicy::new(5, Duration::from_millis(10)));

        let err = executor
            .run_if(
                || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>("invalid hmac")
                    }
                },
                |e| *e != "invalid hmac",
            )
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
