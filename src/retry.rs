//! Exponential backoff with jitter, applied to one sub-request at a time.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{RetryOptions, MAX_RETRY_DELAY_MS};
use crate::error::{BlobError, BlobResult};

/// Retry schedule for a single request. Whole transfers are never retried;
/// each staged block or range read runs under its own policy instance.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    options: RetryOptions,
}

impl RetryPolicy {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    pub fn max_attempts(&self) -> u32 {
        self.options.max_attempts.max(1)
    }

    /// Delay before retry number `retry` (0 = first retry), before jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry);
        let millis = self
            .options
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.options.max_delay_ms)
            .min(MAX_RETRY_DELAY_MS);
        Duration::from_millis(millis)
    }

    /// Delay before retry number `retry`, with up to `jitter` of it added at
    /// random.
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        let jitter = self.options.jitter;
        if !jitter.is_finite() || jitter <= 0.0 {
            return base;
        }
        let scale = 1.0 + jitter.min(1.0) * rand::thread_rng().gen::<f64>();
        Duration::try_from_secs_f64(base.as_secs_f64() * scale).unwrap_or(base)
    }

    /// Runs `attempt` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget is spent. Cancellation interrupts the backoff sleep.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        resource: &str,
        cancel: Option<&CancellationToken>,
        mut attempt: F,
    ) -> BlobResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BlobResult<T>>,
    {
        let max_attempts = self.max_attempts();
        let mut tries = 0;
        loop {
            tries += 1;
            let err = match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_retryable() || tries >= max_attempts {
                return Err(err);
            }

            let delay = self.delay(tries - 1);
            warn!(
                operation,
                resource,
                attempt = tries,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying request"
            );
            match cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {
                            return Err(BlobError::Cancelled {
                                operation,
                                resource: resource.to_string(),
                            });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            RetryOptions::default()
                .with_max_attempts(attempts)
                .with_delays(Duration::from_millis(1), Duration::from_millis(4))
                .with_jitter(0.0),
        )
    }

    fn transient() -> BlobError {
        BlobError::Transport {
            operation: "test",
            resource: "/c/b".into(),
            source: TransportError::Connect("reset".into()),
        }
    }

    #[test]
    fn delays_grow_and_cap() {
        let policy = fast(5);
        assert_eq!(policy.base_delay(0), Duration::from_millis(1));
        assert_eq!(policy.base_delay(1), Duration::from_millis(2));
        assert_eq!(policy.base_delay(2), Duration::from_millis(4));
        assert_eq!(policy.base_delay(10), Duration::from_millis(4));
    }

    #[test]
    fn unchecked_options_never_panic() {
        let policy = RetryPolicy::new(RetryOptions {
            max_attempts: 3,
            base_delay_ms: u64::MAX,
            max_delay_ms: u64::MAX,
            jitter: f64::NAN,
        });
        let cap = Duration::from_millis(MAX_RETRY_DELAY_MS);
        assert_eq!(policy.delay(0), cap);
        assert_eq!(policy.delay(40), cap);

        let policy = RetryPolicy::new(RetryOptions {
            jitter: f64::INFINITY,
            ..RetryOptions::default()
        });
        assert_eq!(policy.delay(0), policy.base_delay(0));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(
            RetryOptions::default()
                .with_delays(Duration::from_millis(100), Duration::from_millis(100))
                .with_jitter(0.5),
        );
        for _ in 0..50 {
            let d = policy.delay(0);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = fast(4)
            .run("test", "/c/b", None, || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: BlobResult<()> = fast(3)
            .run("test", "/c/b", None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            })
            .await;
        assert!(matches!(result, Err(BlobError::Transport { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_at_once() {
        let calls = AtomicU32::new(0);
        let result: BlobResult<()> = fast(3)
            .run("test", "/c/b", None, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BlobError::InvalidInput("nope".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
