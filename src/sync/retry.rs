//! Bounded retry with linear backoff for provider sync attempts
//!
//! [`decide`] is the pure decision step: given the attempt just made and
//! its error, either wait `backoff_base * attempt` and try again or give
//! up. [`RetryPolicy`] drives an async operation with it and also supplies
//! the random pre-attempt jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::error::RetryableError;

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep for the given backoff, then attempt again
    Retry(Duration),
    /// Stop; the last error is terminal
    GiveUp,
}

/// Decide whether to retry after failed attempt number `attempt` (1-based)
///
/// At most `max_retries + 1` attempts are made in total. Errors that are
/// not retryable end the loop immediately.
pub fn decide<E: RetryableError>(
    attempt: u32,
    max_retries: u32,
    backoff_base: Duration,
    last_error: &E,
) -> RetryDecision {
    if attempt > max_retries || !last_error.is_retryable() {
        return RetryDecision::GiveUp;
    }
    RetryDecision::Retry(backoff_base.saturating_mul(attempt))
}

/// Result of running an operation under a [`RetryPolicy`]
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Final result
    pub result: Result<T, E>,
    /// Attempts made, including the last one
    pub attempts: u32,
}

/// Retry limits for one provider's attempt loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff_base: Duration,
    max_jitter: Duration,
}

impl RetryPolicy {
    /// Create a policy from raw values
    pub fn new(max_retries: u32, backoff_base: Duration, max_jitter: Duration) -> Self {
        Self {
            max_retries,
            backoff_base,
            max_jitter,
        }
    }

    /// Create a policy from scheduler configuration, clamped to its bounds
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(
            config.bounded_max_retries(),
            config.bounded_backoff_base(),
            config.bounded_max_jitter(),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    pub fn max_jitter(&self) -> Duration {
        self.max_jitter
    }

    /// Random delay in `[0, max_jitter]`
    pub fn jitter(&self) -> Duration {
        let max_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Run `operation` until it succeeds or [`decide`] gives up
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError + std::fmt::Display,
    {
        let mut attempt = 1u32;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(err) => match decide(attempt, self.max_retries, self.backoff_base, &err) {
                    RetryDecision::Retry(backoff) => {
                        debug!(
                            attempt,
                            max_retries = self.max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %err,
                            "Retrying after failed attempt"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    RetryDecision::GiveUp => {
                        warn!(
                            attempts = attempt,
                            max_retries = self.max_retries,
                            retryable = err.is_retryable(),
                            error = %err,
                            "Giving up"
                        );
                        return RetryOutcome {
                            result: Err(err),
                            attempts: attempt,
                        };
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CryptoError, SyncError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::ZERO)
    }

    // Test 1: Linear backoff grows with the attempt number
    #[test]
    fn test_decide_linear_backoff() {
        let base = Duration::from_millis(1000);
        let err = SyncError::Transient("imap closed".to_string());

        assert_eq!(
            decide(1, 2, base, &err),
            RetryDecision::Retry(Duration::from_millis(1000))
        );
        assert_eq!(
            decide(2, 2, base, &err),
            RetryDecision::Retry(Duration::from_millis(2000))
        );
        assert_eq!(decide(3, 2, base, &err), RetryDecision::GiveUp);
    }

    // Test 2: Zero retries means a single attempt
    #[test]
    fn test_decide_zero_retries() {
        let err = SyncError::NetworkTimeout;
        assert_eq!(
            decide(1, 0, Duration::from_millis(50), &err),
            RetryDecision::GiveUp
        );
    }

    // Test 3: Non-retryable errors give up immediately
    #[test]
    fn test_decide_non_retryable() {
        let base = Duration::from_millis(50);
        assert_eq!(
            decide(1, 5, base, &SyncError::MissingCredentials("p1".to_string())),
            RetryDecision::GiveUp
        );
        assert_eq!(
            decide(
                1,
                5,
                base,
                &SyncError::Crypto(CryptoError::Decryption("bad tag".to_string()))
            ),
            RetryDecision::GiveUp
        );
        assert_eq!(
            decide(1, 5, base, &SyncError::TokenRefresh("invalid_grant".to_string())),
            RetryDecision::Retry(base)
        );
    }

    // Test 4: Success on first attempt returns immediately
    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let outcome = fast_policy(3)
            .execute(|_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, SyncError>(42)
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    // Test 5: Retries until success
    #[tokio::test]
    async fn test_retry_until_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let outcome = fast_policy(3)
            .execute(|attempt| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(SyncError::Transient("flaky".to_string()))
                    } else {
                        Ok("synced")
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), "synced");
        assert_eq!(outcome.attempts, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    // Test 6: Exactly max_retries + 1 attempts on persistent failure
    #[tokio::test]
    async fn test_exhausts_retries() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let outcome = fast_policy(2)
            .execute(|_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(SyncError::Transient("still down".to_string()))
                }
            })
            .await;

        assert!(matches!(outcome.result, Err(SyncError::Transient(_))));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    // Test 7: Non-retryable error stops after one attempt
    #[tokio::test]
    async fn test_non_retryable_stops() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let outcome = fast_policy(5)
            .execute(|_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(SyncError::MissingCredentials("p1".to_string()))
                }
            })
            .await;

        assert!(matches!(outcome.result, Err(SyncError::MissingCredentials(_))));
        assert_eq!(outcome.attempts, 1);
    }

    // Test 8: Backoff actually waits between attempts
    #[tokio::test]
    async fn test_backoff_waits() {
        let policy = RetryPolicy::new(2, Duration::from_millis(20), Duration::ZERO);
        let start = std::time::Instant::now();

        let outcome = policy
            .execute(|_| async { Err::<(), _>(SyncError::NetworkTimeout) })
            .await;

        assert_eq!(outcome.attempts, 3);
        // 20ms after attempt 1, 40ms after attempt 2
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    // Test 9: Jitter stays within bounds
    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::new(2, Duration::from_millis(50), Duration::from_millis(25));
        for _ in 0..200 {
            assert!(policy.jitter() <= Duration::from_millis(25));
        }

        assert_eq!(fast_policy(1).jitter(), Duration::ZERO);
    }

    // Test 10: Policy from config is clamped
    #[test]
    fn test_policy_from_config_clamped() {
        let config = SchedulerConfig {
            max_retries: 50,
            backoff_base_ms: 1,
            max_jitter_ms: 999_999,
            ..Default::default()
        };
        let policy = RetryPolicy::from_config(&config);

        assert_eq!(policy.max_retries(), 5);
        assert_eq!(policy.backoff_base(), Duration::from_millis(50));
        assert_eq!(policy.max_jitter(), Duration::from_millis(10_000));
    }
}
