//! Bounded retry with exponential backoff.
//!
//! The retry behaviour is an explicit policy value consumed by a generic
//! [`with_retry`] combinator, so the delay schedule can be unit tested and
//! individual clients can swap in a faster policy under test.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// Backoff configuration for retried remote calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Factor applied to the delay after every failed attempt.
    pub multiplier: u32,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy applied to every Google Drive call: 3 attempts, delays of
    /// 1 s then 2 s, doubling and capped at 10 s. No jitter; retries are
    /// strictly sequential.
    pub const fn remote_default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            multiplier: 2,
            max_delay: Duration::from_millis(10_000),
        }
    }

    /// Delay to wait after the failed attempt with the given zero-based index.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::remote_default()
    }
}

/// Run `op` until it succeeds, the policy is exhausted, or it fails with an
/// error the predicate refuses to retry. The last error propagates unchanged.
pub async fn with_retry<T, P, F, Fut>(
    policy: &RetryPolicy,
    should_retry: P,
    mut op: F,
) -> SyncResult<T>
where
    P: Fn(&SyncError) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let exhausted = attempt + 1 >= policy.max_attempts;
                if exhausted || !should_retry(&err) {
                    return Err(err);
                }
                let delay = policy.delay_for(attempt);
                debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after transient failure: {}",
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::errors;
    use std::cell::Cell;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            multiplier: 2,
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn delay_schedule_doubles_and_caps() {
        let policy = RetryPolicy::remote_default();
        let delays: Vec<u64> = (0..6)
            .map(|n| policy.delay_for(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10_000, 10_000]);
    }

    #[tokio::test]
    async fn permanent_error_is_attempted_exactly_once() {
        let calls = Cell::new(0u32);
        let result: SyncResult<()> = with_retry(&fast_policy(), SyncError::is_transient, || {
            calls.set(calls.get() + 1);
            async { Err(errors::remote(404, "not found")) }
        })
        .await;

        assert!(matches!(result, Err(SyncError::Remote { status: 404, .. })));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn transient_error_exhausts_all_attempts() {
        let calls = Cell::new(0u32);
        let result: SyncResult<()> = with_retry(&fast_policy(), SyncError::is_transient, || {
            calls.set(calls.get() + 1);
            async { Err(errors::remote(503, "unavailable")) }
        })
        .await;

        assert!(matches!(result, Err(SyncError::Remote { status: 503, .. })));
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn success_after_two_transient_failures() {
        let calls = Cell::new(0u32);
        let result = with_retry(&fast_policy(), SyncError::is_transient, || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move {
                if n < 3 {
                    Err(errors::remote(503, "unavailable"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn non_remote_errors_are_never_retried() {
        let calls = Cell::new(0u32);
        let result: SyncResult<()> = with_retry(&fast_policy(), SyncError::is_transient, || {
            calls.set(calls.get() + 1);
            async { Err(errors::auth("no tokens")) }
        })
        .await;

        assert!(matches!(result, Err(SyncError::Auth { .. })));
        assert_eq!(calls.get(), 1);
    }
}
