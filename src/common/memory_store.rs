//! Process-local quota store
//!
//! All windows live in one `HashMap` behind a single async mutex, so a
//! consume is atomic for every task in this process. It is NOT shared
//! between processes: with more than one instance of the service each
//! instance enforces its own quota. Use [`RedisStore`](super::RedisStore)
//! for horizontally scaled deployments.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::store::{ConsumptionRecord, RateLimitStore, StoreOutcome, WindowPolicy};
use crate::error::StoreError;

/// Default interval between sweeps of expired records
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct Shared {
    records: HashMap<String, ConsumptionRecord>,
    next_sweep: Instant,
}

impl Shared {
    fn maybe_sweep(&mut self, now: Instant, interval: Duration) {
        if now < self.next_sweep {
            return;
        }
        let before = self.records.len();
        self.records
            .retain(|_, record| !record.window_expired(now) || record.is_blocked(now));
        let removed = before - self.records.len();
        if removed > 0 {
            tracing::debug!("Swept {} expired rate limit records", removed);
        }
        self.next_sweep = now + interval;
    }
}

/// In-memory [`RateLimitStore`]
#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<Shared>,
    sweep_interval: Duration,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a store that drops expired records at most once per `interval`
    pub fn with_sweep_interval(interval: Duration) -> Self {
        Self {
            state: Mutex::new(Shared {
                records: HashMap::new(),
                next_sweep: Instant::now() + interval,
            }),
            sweep_interval: interval,
        }
    }

    /// Number of records currently held, expired or not
    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every expired, unblocked record now. Returns how many went.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let before = state.records.len();
        state
            .records
            .retain(|_, record| !record.window_expired(now) || record.is_blocked(now));
        state.next_sweep = now + self.sweep_interval;
        before - state.records.len()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryStore {
    async fn consume(
        &self,
        key: &str,
        cost: u32,
        policy: &WindowPolicy,
    ) -> Result<StoreOutcome, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.maybe_sweep(now, self.sweep_interval);

        let mut record = match state.records.get(key) {
            Some(existing) if !existing.window_expired(now) => existing.clone(),
            Some(expired) => {
                // New window, but an active block outlives the old one
                let mut fresh = ConsumptionRecord::fresh(key, now, policy.window);
                fresh.blocked_until = expired.blocked_until.filter(|until| now < *until);
                fresh
            }
            None => ConsumptionRecord::fresh(key, now, policy.window),
        };

        if record.is_blocked(now) {
            return Ok(StoreOutcome {
                allowed: false,
                record,
            });
        }

        match record.points_consumed.checked_add(cost) {
            Some(total) if total <= policy.points => {
                record.points_consumed = total;
                state.records.insert(key.to_string(), record.clone());
                Ok(StoreOutcome {
                    allowed: true,
                    record,
                })
            }
            _ => {
                if !policy.block.is_zero() {
                    record.blocked_until = Some(now + policy.block);
                    state.records.insert(key.to_string(), record.clone());
                }
                Ok(StoreOutcome {
                    allowed: false,
                    record,
                })
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<ConsumptionRecord>, StoreError> {
        let now = Instant::now();
        let state = self.state.lock().await;
        Ok(state
            .records
            .get(key)
            .filter(|record| !record.window_expired(now) || record.is_blocked(now))
            .cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.state.lock().await.records.remove(key);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn policy(points: u32, window_secs: u64, block_secs: u64) -> WindowPolicy {
        WindowPolicy {
            points,
            window: Duration::from_secs(window_secs),
            block: Duration::from_secs(block_secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_within_quota() {
        let store = InMemoryStore::new();
        let p = policy(3, 60, 0);

        for expected in 1..=3 {
            let outcome = store.consume("k", 1, &p).await.unwrap();
            assert!(outcome.allowed);
            assert_eq!(outcome.record.points_consumed, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_denial_leaves_counter_untouched() {
        let store = InMemoryStore::new();
        let p = policy(5, 60, 0);

        assert!(store.consume("k", 4, &p).await.unwrap().allowed);
        let denied = store.consume("k", 2, &p).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.record.points_consumed, 4);

        // The remaining point is still usable
        let last = store.consume("k", 1, &p).await.unwrap();
        assert!(last.allowed);
        assert_eq!(last.record.points_consumed, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_fresh_key_is_not_persisted() {
        let store = InMemoryStore::new();
        let p = policy(2, 60, 0);

        let outcome = store.consume("k", 3, &p).await.unwrap();
        assert!(!outcome.allowed);
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_restarts_after_expiry() {
        let store = InMemoryStore::new();
        let p = policy(2, 10, 0);

        store.consume("k", 2, &p).await.unwrap();
        assert!(!store.consume("k", 1, &p).await.unwrap().allowed);

        advance(Duration::from_secs(10)).await;

        let outcome = store.consume("k", 1, &p).await.unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.record.points_consumed, 1);
        assert_eq!(outcome.record.ms_before_next(Instant::now()), 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_windows_are_per_key() {
        let store = InMemoryStore::new();
        let p = policy(1, 60, 0);

        assert!(store.consume("a", 1, &p).await.unwrap().allowed);
        advance(Duration::from_secs(30)).await;
        assert!(store.consume("b", 1, &p).await.unwrap().allowed);

        let a = store.get("a").await.unwrap().unwrap();
        let b = store.get("b").await.unwrap().unwrap();
        assert!(a.window_expires_at < b.window_expires_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_after_denial() {
        let store = InMemoryStore::new();
        let p = policy(1, 5, 30);

        assert!(store.consume("k", 1, &p).await.unwrap().allowed);
        let denied = store.consume("k", 1, &p).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.record.blocked_ms(Instant::now()), 30_000);

        // Window is over but the block is not
        advance(Duration::from_secs(10)).await;
        let still_blocked = store.consume("k", 1, &p).await.unwrap();
        assert!(!still_blocked.allowed);
        assert_eq!(still_blocked.record.points_consumed, 0);
        assert_eq!(still_blocked.record.ms_before_next(Instant::now()), 20_000);

        advance(Duration::from_secs(20)).await;
        assert!(store.consume("k", 1, &p).await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_hides_expired_records() {
        let store = InMemoryStore::new();
        let p = policy(3, 5, 0);

        store.consume("k", 1, &p).await.unwrap();
        assert!(store.get("k").await.unwrap().is_some());

        advance(Duration::from_secs(6)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(store.len().await, 1);
        assert_eq!(store.purge_expired().await, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_runs_during_consume() {
        let store = InMemoryStore::with_sweep_interval(Duration::from_secs(60));
        let p = policy(3, 5, 0);

        store.consume("old", 1, &p).await.unwrap();
        advance(Duration::from_secs(61)).await;
        store.consume("new", 1, &p).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert!(store.get("new").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete() {
        let store = InMemoryStore::new();
        let p = policy(1, 60, 0);

        store.consume("k", 1, &p).await.unwrap();
        assert!(!store.consume("k", 1, &p).await.unwrap().allowed);

        store.delete("k").await.unwrap();
        assert!(store.consume("k", 1, &p).await.unwrap().allowed);
        assert_eq!(store.backend(), "memory");
    }
}
