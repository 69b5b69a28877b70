//! Distributed send throttle over a single shared timestamp.
//!
//! Every process reads the last-send instant from the store and only sends
//! once `min_interval` has passed. Claiming a slot is a compare-and-swap on
//! that key, so two processes can't both claim it from the same reading on
//! backends with an atomic CAS. On backends without one the throttle is
//! approximate, which only affects strict rate adherence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::campaign::keys::RATE_LIMIT_KEY;
use crate::store::{KvStore, MemoryStore};

/// Attempt bound when the interval is zero and only CAS races can cause retries.
const ZERO_INTERVAL_ATTEMPTS: u32 = 6;

/// Outcome of a slot request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDecision {
    /// Send now. `at_ms` is the epoch-millis instant recorded as the last send.
    Granted { at_ms: i64 },
    /// No slot within the wait bound, or the store failed. Don't send.
    Denied,
}

impl SlotDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, SlotDecision::Granted { .. })
    }
}

/// Gatekeeper for outbound sends.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Wait up to `max_wait` for permission to send one email.
    async fn acquire_send_slot(&self, max_wait: Duration) -> SlotDecision;
}

/// Rate limiter backed by the shared timestamp key in a `KvStore`.
pub struct StoreRateLimiter {
    store: Arc<dyn KvStore>,
    min_interval: Duration,
}

impl StoreRateLimiter {
    pub fn new(store: Arc<dyn KvStore>, min_interval: Duration) -> Self {
        Self {
            store,
            min_interval,
        }
    }

    /// A process-local limiter for single-process deployments.
    pub fn in_memory(min_interval: Duration) -> Self {
        Self::new(Arc::new(MemoryStore::new()), min_interval)
    }

    fn max_attempts(&self, max_wait: Duration) -> u32 {
        let interval_ms = self.min_interval.as_millis();
        if interval_ms == 0 {
            return ZERO_INTERVAL_ATTEMPTS;
        }
        let attempts = max_wait.as_millis().div_ceil(interval_ms);
        u32::try_from(attempts).unwrap_or(u32::MAX).max(1)
    }
}

#[async_trait]
impl RateLimiter for StoreRateLimiter {
    async fn acquire_send_slot(&self, max_wait: Duration) -> SlotDecision {
        let deadline = Instant::now() + max_wait;
        let max_attempts = self.max_attempts(max_wait);
        let interval_ms = i64::try_from(self.min_interval.as_millis()).unwrap_or(i64::MAX);

        for attempt in 1..=max_attempts {
            let last = match self.store.get(RATE_LIMIT_KEY).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Rate limit read failed, denying send");
                    return SlotDecision::Denied;
                }
            };
            let last_ms = last.as_deref().and_then(|s| s.parse::<i64>().ok());
            let now_ms = Utc::now().timestamp_millis();

            let wait_ms = match last_ms {
                Some(prev) => interval_ms.saturating_sub(now_ms.saturating_sub(prev).max(0)),
                None => 0,
            };

            if wait_ms <= 0 {
                match self
                    .store
                    .compare_and_swap(RATE_LIMIT_KEY, last.as_deref(), &now_ms.to_string())
                    .await
                {
                    Ok(true) => return SlotDecision::Granted { at_ms: now_ms },
                    Ok(false) => {
                        debug!(attempt, "Lost rate limit slot to another sender");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "Rate limit write failed, denying send");
                        return SlotDecision::Denied;
                    }
                }
            }

            let wait = Duration::from_millis(wait_ms.unsigned_abs());
            if attempt == max_attempts || Instant::now() + wait > deadline {
                break;
            }
            tokio::time::sleep(wait).await;
        }

        debug!(max_wait_ms = max_wait.as_millis() as u64, "No send slot within wait bound");
        SlotDecision::Denied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[tokio::test]
    async fn first_request_is_granted() {
        let limiter = StoreRateLimiter::in_memory(Duration::from_millis(500));
        assert!(limiter
            .acquire_send_slot(Duration::from_millis(3000))
            .await
            .is_granted());
    }

    #[tokio::test]
    async fn denies_when_wait_exceeds_bound() {
        let limiter = StoreRateLimiter::in_memory(Duration::from_secs(10));
        assert!(limiter.acquire_send_slot(Duration::from_millis(100)).await.is_granted());

        let started = std::time::Instant::now();
        assert_eq!(
            limiter.acquire_send_slot(Duration::from_millis(100)).await,
            SlotDecision::Denied
        );
        // Gave up without sleeping out the full interval.
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn waits_for_the_interval_then_grants() {
        let limiter = StoreRateLimiter::in_memory(Duration::from_millis(100));
        let SlotDecision::Granted { at_ms: first } =
            limiter.acquire_send_slot(Duration::from_secs(1)).await
        else {
            panic!("first slot should be granted");
        };
        let SlotDecision::Granted { at_ms: second } =
            limiter.acquire_send_slot(Duration::from_secs(1)).await
        else {
            panic!("second slot should be granted after waiting");
        };
        assert!(second - first >= 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_grants_are_spaced_by_interval() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let interval = Duration::from_millis(50);

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let limiter = StoreRateLimiter::new(Arc::clone(&store), interval);
                tokio::spawn(async move { limiter.acquire_send_slot(Duration::from_secs(5)).await })
            })
            .collect();

        let mut granted: Vec<i64> = Vec::new();
        for result in futures::future::join_all(handles).await {
            match result.unwrap() {
                SlotDecision::Granted { at_ms } => granted.push(at_ms),
                SlotDecision::Denied => panic!("every caller should eventually get a slot"),
            }
        }
        granted.sort_unstable();
        for pair in granted.windows(2) {
            assert!(pair[1] - pair[0] >= 50, "grants too close: {pair:?}");
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl KvStore for BrokenStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set_members(&self, _set_key: &str) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn add_to_set(&self, _set_key: &str, _member: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn remove_from_set(&self, _set_key: &str, _member: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set_cardinality(&self, _set_key: &str) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn store_errors_deny() {
        let limiter = StoreRateLimiter::new(Arc::new(BrokenStore), Duration::from_millis(500));
        assert_eq!(
            limiter.acquire_send_slot(Duration::from_secs(3)).await,
            SlotDecision::Denied
        );
    }

    #[test]
    fn attempt_bound_follows_wait_budget() {
        let limiter = StoreRateLimiter::in_memory(Duration::from_millis(500));
        assert_eq!(limiter.max_attempts(Duration::from_millis(3000)), 6);
        assert_eq!(limiter.max_attempts(Duration::from_millis(10)), 1);
        let zero = StoreRateLimiter::in_memory(Duration::ZERO);
        assert_eq!(zero.max_attempts(Duration::from_secs(3)), ZERO_INTERVAL_ATTEMPTS);
    }
}
