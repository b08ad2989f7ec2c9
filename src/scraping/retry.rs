//! Retry with capped exponential backoff
//!
//! Only transient failures are retried: the allow-listed HTTP statuses plus
//! transport timeouts and connect errors. Everything else fails the item on the
//! first attempt. The whole sequence, sleeps included, is bounded by the
//! command timeout.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RetryConfig;

use super::fetcher::FetchError;

/// HTTP statuses worth retrying
pub const RETRYABLE_STATUS_CODES: [u16; 9] = [408, 409, 423, 425, 429, 500, 502, 503, 504];

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS_CODES.contains(&status)
}

/// Backoff parameters for one class of outbound calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: (f64, f64),
    pub max_delay: Duration,
    /// Overall deadline for all attempts and sleeps
    pub budget: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig, budget: Duration) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            backoff_factor: config.backoff_factor,
            jitter: (config.jitter_min, config.jitter_max),
            max_delay: Duration::from_millis(config.max_delay_ms),
            budget,
        }
    }

    /// A single attempt, no retries.
    pub fn none(budget: Duration) -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            backoff_factor: 1.0,
            jitter: (1.0, 1.0),
            max_delay: Duration::ZERO,
            budget,
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(retry as i32);
        let (lo, hi) = self.jitter;
        let jitter = if hi > lo {
            rand::thread_rng().gen_range(lo..hi)
        } else {
            lo
        };
        let millis = (base * jitter).max(0.0) as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default(), Duration::from_secs(30 * 60))
    }
}

/// Result of a retried operation together with how many attempts it took.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: Result<T, FetchError>,
    pub attempts: u32,
}

impl<T> Retried<T> {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn into_result(self) -> Result<T, FetchError> {
        self.result
    }
}

/// Run `op` until it succeeds, fails permanently, runs out of attempts, or the
/// policy's budget is spent.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Retried<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let deadline = Instant::now() + policy.budget;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = match tokio::time::timeout(remaining, op()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(FetchError::Timeout(policy.budget)),
        };

        let err = match outcome {
            Ok(value) => {
                if attempts > 1 {
                    debug!("{} succeeded after {} attempts", label, attempts);
                }
                return Retried { result: Ok(value), attempts };
            }
            Err(err) => err,
        };

        if !err.is_transient() || attempts >= policy.max_attempts {
            return Retried { result: Err(err), attempts };
        }

        let delay = policy.delay_for(attempts - 1);
        if Instant::now() + delay >= deadline {
            warn!("{}: retry budget of {:?} exhausted after {} attempts", label, policy.budget, attempts);
            return Retried { result: Err(err), attempts };
        }

        warn!(
            "{}: attempt {}/{} failed ({}), retrying in {:?}",
            label, attempts, policy.max_attempts, err, delay
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            backoff_factor: 2.0,
            jitter: (1.0, 1.0),
            max_delay: Duration::from_millis(5),
            budget: Duration::from_secs(5),
        }
    }

    fn status(code: u16) -> FetchError {
        FetchError::Status {
            status: code,
            url: "https://example.test/api".to_string(),
        }
    }

    #[test]
    fn test_retryable_statuses() {
        for code in [408, 409, 423, 425, 429, 500, 502, 503, 504] {
            assert!(is_retryable_status(code), "{} should be retryable", code);
        }
        for code in [400, 401, 403, 404, 410, 422, 501] {
            assert!(!is_retryable_status(code), "{} should not be retryable", code);
        }
    }

    #[test]
    fn test_delay_growth_is_capped() {
        let policy = RetryPolicy {
            jitter: (1.0, 1.0),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(8_000));
        assert_eq!(policy.delay_for(10), Duration::from_millis(45_000));
    }

    #[test]
    fn test_delay_jitter_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.delay_for(0).as_millis();
            assert!((1_700..=2_500).contains(&d), "delay {} outside jitter range", d);
        }
    }

    #[tokio::test]
    async fn test_429_then_200_succeeds_with_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let retried = retry_with_backoff(&fast_policy(3), "test", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(status(429))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert!(retried.retries() >= 1);
        assert_eq!(retried.result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_404_fails_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let retried: Retried<()> = retry_with_backoff(&fast_policy(3), "test", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(status(404))
            }
        })
        .await;

        assert!(matches!(retried.result, Err(FetchError::Status { status: 404, .. })));
        assert_eq!(retried.retries(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let retried: Retried<()> =
            retry_with_backoff(&fast_policy(3), "test", || async { Err(status(503)) }).await;
        assert_eq!(retried.attempts, 3);
        assert!(retried.result.is_err());
    }

    #[tokio::test]
    async fn test_parse_errors_are_permanent() {
        let retried: Retried<()> = retry_with_backoff(&fast_policy(5), "test", || async {
            Err(FetchError::Parse("bad json".to_string()))
        })
        .await;
        assert_eq!(retried.attempts, 1);
    }

    #[tokio::test]
    async fn test_budget_bounds_slow_operation() {
        let policy = RetryPolicy {
            budget: Duration::from_millis(20),
            ..fast_policy(5)
        };
        let retried: Retried<()> = retry_with_backoff(&policy, "test", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(retried.result, Err(FetchError::Timeout(_))));
    }
}
