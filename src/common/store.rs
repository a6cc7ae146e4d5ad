//! Quota store abstraction
//!
//! The rate limiter never touches counters itself. Every consumption is a
//! single call into a [`RateLimitStore`], which must apply the
//! check-and-increment atomically with respect to every other caller that
//! shares the same backing store.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::StoreError;

/// Quota parameters the store needs to evaluate one consumption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    /// Points available per window
    pub points: u32,
    /// Window length, counted from the first consumption
    pub window: Duration,
    /// How long a key stays blocked after a denial (zero disables blocking)
    pub block: Duration,
}

/// Per-key consumption state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumptionRecord {
    pub key: String,
    pub points_consumed: u32,
    pub window_expires_at: Instant,
    pub blocked_until: Option<Instant>,
}

impl ConsumptionRecord {
    /// A record for a window that has not been persisted yet
    pub fn fresh(key: &str, now: Instant, window: Duration) -> Self {
        Self {
            key: key.to_string(),
            points_consumed: 0,
            window_expires_at: now + window,
            blocked_until: None,
        }
    }

    pub fn is_blocked(&self, now: Instant) -> bool {
        self.blocked_until.is_some_and(|until| now < until)
    }

    pub fn window_expired(&self, now: Instant) -> bool {
        now >= self.window_expires_at
    }

    /// Time until the caller may try again: the block if one is active,
    /// otherwise the end of the current window
    pub fn ms_before_next(&self, now: Instant) -> u64 {
        let until = match self.blocked_until {
            Some(blocked) if now < blocked => blocked,
            _ => self.window_expires_at,
        };
        until.saturating_duration_since(now).as_millis() as u64
    }

    pub fn blocked_ms(&self, now: Instant) -> u64 {
        self.blocked_until
            .map(|until| until.saturating_duration_since(now).as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Result of an atomic consume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOutcome {
    pub allowed: bool,
    /// State after the operation. On a denial this is the untouched record.
    pub record: ConsumptionRecord,
}

/// Backend storage for per-key quota windows
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Atomically add `cost` to the key's window if it fits.
    ///
    /// A missing or expired record starts a fresh window before `cost` is
    /// applied. If the new total would exceed `policy.points` the call is
    /// denied and the counter is left unchanged.
    async fn consume(
        &self,
        key: &str,
        cost: u32,
        policy: &WindowPolicy,
    ) -> Result<StoreOutcome, StoreError>;

    /// Read the key's live record without consuming anything
    async fn get(&self, key: &str) -> Result<Option<ConsumptionRecord>, StoreError>;

    /// Forget everything about the key
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Short backend name for logs and status output
    fn backend(&self) -> &'static str;
}
