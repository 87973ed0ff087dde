//! Shared retry policy for datastore and gateway calls.
//!
//! One explicitly-constructed policy is injected into the orchestrator and
//! reused at every suspension point, instead of ad hoc retry loops at call
//! sites. Backoff is exponential from `base_delay`, capped at 2^5 times the
//! base (the same 1s, 2s, 4s, ... 32s ladder used for HTTP backoff).

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (0-based): base << attempt, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * (1 << attempt.min(5))
    }

    /// Run `op`, retrying while `retryable` says the error is transient and
    /// attempts remain. Returns the last error once exhausted.
    pub async fn run<T, E, Fut, F, R>(&self, mut op: F, retryable: R) -> RetryResult<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
    {
        let mut retries = 0u32;
        loop {
            match op().await {
                Ok(value) => {
                    return RetryResult {
                        result: Ok(value),
                        retries,
                    }
                }
                Err(e) if retries + 1 < self.max_attempts && retryable(&e) => {
                    tokio::time::sleep(self.delay_for(retries)).await;
                    retries += 1;
                }
                Err(e) => {
                    return RetryResult {
                        result: Err(e),
                        retries,
                    }
                }
            }
        }
    }
}

/// Outcome of a retried operation, carrying the retry count so the
/// orchestrator's telemetry stays accurate.
pub struct RetryResult<T, E> {
    pub result: Result<T, E>,
    pub retries: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));

        let outcome = policy
            .run(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err("transient")
                        } else {
                            Ok(n)
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(outcome.result.unwrap(), 2);
        assert_eq!(outcome.retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1));

        let outcome = policy
            .run(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("fatal") }
                },
                |_| false,
            )
            .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.retries, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let outcome = policy
            .run(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("transient") }
                },
                |_| true,
            )
            .await;

        assert!(outcome.result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.retries, 2);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(10), Duration::from_secs(32));
    }
}
