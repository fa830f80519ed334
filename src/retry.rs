//! Backoff computation for message-level retries and broker call-site retries.
//!
//! Message retry state is never stored by the consumer: [`RetryState`] is derived
//! from the delivery itself, so it survives restarts without extra persistence.

use std::time::Duration;

use futures_util::future::BoxFuture;
use rand::Rng;
use tracing::warn;

use crate::{message::SensorMessage, source::BrokerError};

/// Exponential backoff with a cap and jitter.
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    base: Duration,
    cap: Duration,
}

impl RetryScheduler {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
        }
    }

    /// `min(cap, base * 2^attempt)`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);

        Duration::from_millis(base_ms.saturating_mul(factor)).min(self.cap)
    }

    /// Delay before the next delivery after `attempt` failed attempts.
    ///
    /// Jitter is ±25% of the capped delay, and the result never exceeds the cap.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        let delay_ms = delay.as_millis() as u64;
        let spread = delay_ms / 4;
        if spread == 0 {
            return delay;
        }

        let jittered = rand::thread_rng().gen_range(delay_ms - spread..=delay_ms + spread);

        Duration::from_millis(jittered).min(self.cap)
    }
}

/// Retry bookkeeping for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Failed attempts before this delivery.
    pub attempt: u32,
}

impl RetryState {
    /// The larger of the broker's redelivery count and the `attempt` attribute.
    pub fn from_message(message: &SensorMessage) -> Self {
        let redeliveries = message.delivery_count.saturating_sub(1);
        let carried = message.attempt_attribute().unwrap_or(0);

        Self {
            attempt: redeliveries.max(carried),
        }
    }

    /// Whether a failure on this delivery has used up every retry.
    pub fn exhausted(&self, max_retries: u32) -> bool {
        self.attempt >= max_retries
    }
}

/// Short retry loop around individual broker calls.
///
/// Distinct from message retries: a failed `delete` is retried here a few times
/// before the worker gives up and lets the visibility timeout take over.
#[derive(Debug, Clone)]
pub struct BrokerRetry {
    attempts: u32,
    backoff: RetryScheduler,
}

impl BrokerRetry {
    pub fn new(attempts: u32, base: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: RetryScheduler::new(base, base * 8),
        }
    }

    pub async fn call<'a, T, F>(&self, operation: &'static str, mut f: F) -> Result<T, BrokerError>
    where
        F: FnMut() -> BoxFuture<'a, Result<T, BrokerError>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.attempts => {
                    let delay = self.backoff.next_delay(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::message::{tests::message, ATTEMPT_ATTRIBUTE};

    #[test]
    fn test_base_delay_doubles_up_to_cap() {
        let scheduler =
            RetryScheduler::new(Duration::from_millis(100), Duration::from_millis(1_000));

        let expected = [100, 200, 400, 800, 1_000, 1_000];
        for (attempt, ms) in expected.into_iter().enumerate() {
            assert_eq!(
                scheduler.base_delay(attempt as u32),
                Duration::from_millis(ms)
            );
        }

        assert_eq!(scheduler.base_delay(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_base_delay_is_monotonic() {
        let scheduler = RetryScheduler::new(Duration::from_millis(7), Duration::from_secs(90));

        for attempt in 0..80 {
            assert!(scheduler.base_delay(attempt + 1) >= scheduler.base_delay(attempt));
        }
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let scheduler =
            RetryScheduler::new(Duration::from_millis(400), Duration::from_millis(2_000));

        for attempt in 0..6 {
            let base = scheduler.base_delay(attempt);
            for _ in 0..50 {
                let delay = scheduler.next_delay(attempt);
                assert!(delay >= base - base / 4, "{delay:?} too short for {base:?}");
                assert!(delay <= base + base / 4, "{delay:?} too long for {base:?}");
                assert!(delay <= Duration::from_millis(2_000));
            }
        }
    }

    #[test]
    fn test_retry_state_from_message() {
        let mut msg = message("{}");
        assert_eq!(RetryState::from_message(&msg).attempt, 0);

        msg.delivery_count = 3;
        assert_eq!(RetryState::from_message(&msg).attempt, 2);

        msg.attributes
            .insert(ATTEMPT_ATTRIBUTE.to_owned(), "5".to_owned());
        assert_eq!(RetryState::from_message(&msg).attempt, 5);

        msg.delivery_count = 0;
        msg.attributes.clear();
        assert_eq!(RetryState::from_message(&msg).attempt, 0);
    }

    #[test]
    fn test_retry_state_exhausted() {
        assert!(!RetryState { attempt: 0 }.exhausted(3));
        assert!(!RetryState { attempt: 2 }.exhausted(3));
        assert!(RetryState { attempt: 3 }.exhausted(3));
        assert!(RetryState { attempt: 0 }.exhausted(0));
    }

    #[tokio::test]
    async fn test_broker_retry_recovers() {
        let retry = BrokerRetry::new(3, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result = retry
            .call("receive", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    if n < 2 {
                        Err(BrokerError::unavailable("receive", "connection refused"))
                    } else {
                        Ok(n)
                    }
                })
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_broker_retry_gives_up() {
        let retry = BrokerRetry::new(2, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry
            .call("delete", || {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err(BrokerError::unavailable("delete", "timeout")) })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_broker_retry_skips_rejections() {
        let retry = BrokerRetry::new(5, Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry
            .call("delete", || {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err(BrokerError::rejected("delete", "queue does not exist")) })
            })
            .await;

        assert!(matches!(result, Err(BrokerError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
