//! Timeout and exponential backoff around single store operations.

use std::{future::Future, time::Duration};

use rand::Rng;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::{
    dao::storage::{StoreError, StoreResult},
    error::CoreError,
};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(8);
const DEFAULT_JITTER: f64 = 0.3;

/// Backoff parameters for transient store failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for each further attempt.
    pub base_delay: Duration,
    /// Upper bound of the delay before jitter.
    pub max_delay: Duration,
    /// Relative jitter applied to each delay (0.3 means ±30%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given failed attempt (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Backoff with the configured random jitter applied.
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        delay.mul_f64(factor.max(0.0))
    }
}

/// Run `op` with a per-attempt timeout, retrying transient failures with backoff.
///
/// Non-transient failures (permission, decode) are returned after the first attempt.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    op_timeout: Duration,
    operation: &str,
    mut op: F,
) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let err = match timeout(op_timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err,
            Err(_) => StoreError::Timeout {
                operation: operation.to_string(),
            },
        };

        if !err.is_transient() {
            debug!(operation, error = %err, "store operation failed permanently");
            return Err(err.into());
        }

        if attempt >= policy.max_attempts {
            warn!(
                operation,
                attempt,
                error = %err,
                "exhausted store retry budget"
            );
            return Err(CoreError::TransientStore {
                attempts: attempt,
                source: err,
            });
        }

        let delay = policy.jittered_backoff(attempt);
        warn!(
            operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "store operation failed; retrying"
        );
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            jitter: 0.3,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
        assert_eq!(policy.backoff(30), Duration::from_millis(300));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = policy();
        for _ in 0..200 {
            let delay = policy.jittered_backoff(2);
            assert!(delay >= Duration::from_millis(140));
            assert!(delay <= Duration::from_millis(260));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_retry(&policy(), Duration::from_secs(1), "write", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Disconnected)
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_surfaces_transient_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = with_retry(&policy(), Duration::from_secs(1), "write", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Disconnected) }
        })
        .await;

        assert!(matches!(
            result,
            Err(CoreError::TransientStore { attempts: 4, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn permission_errors_fail_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = with_retry(&policy(), Duration::from_secs(1), "write", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Err(StoreError::PermissionDenied {
                    path: "games/ABC123/hostId".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(CoreError::Permission { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_operations_time_out_and_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_retry(&policy(), Duration::from_secs(10), "read", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    futures::future::pending::<()>().await;
                }
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
