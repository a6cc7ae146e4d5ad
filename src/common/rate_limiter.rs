//! Per-key rolling-window rate limiter
//!
//! Each key gets its own window that starts at the key's first consumption
//! (not aligned to the wall clock). The counting itself is delegated to a
//! [`RateLimitStore`] so the same limiter runs on the in-memory store for a
//! single instance or on Redis for a fleet.
//!
//! Store outages never bubble out of [`RateLimiter::consume`]. They are
//! turned into a decision according to the configured [`FailureMode`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::store::{RateLimitStore, WindowPolicy};
use crate::error::{Error, Result};

/// What to do when the backing store cannot be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Allow the request and keep serving (read-only endpoints)
    FailOpen,
    /// Deny the request to protect the backend (mutating endpoints)
    #[default]
    FailClosed,
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::FailOpen => write!(f, "fail-open"),
            Self::FailClosed => write!(f, "fail-closed"),
        }
    }
}

impl FromStr for FailureMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "open" | "fail-open" | "fail_open" | "allow" => Ok(Self::FailOpen),
            "closed" | "fail-closed" | "fail_closed" | "deny" => Ok(Self::FailClosed),
            other => Err(format!("unknown failure mode '{}'", other)),
        }
    }
}

/// Configuration for the rate limiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterConfig {
    /// Points available to each key per window
    pub points_per_window: u32,
    /// Window length in seconds
    pub window_seconds: u64,
    /// Block length after a denial, zero to only deny
    pub block_seconds: u64,
    /// Prepended to every key, e.g. `rl:api`
    pub key_prefix: String,
    /// Behaviour while the store is unreachable
    pub failure_mode: FailureMode,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            points_per_window: 50,
            window_seconds: 60,
            block_seconds: 0,
            key_prefix: "rl:api".to_string(),
            failure_mode: FailureMode::FailClosed,
        }
    }
}

impl LimiterConfig {
    pub fn with_points(mut self, points: u32) -> Self {
        self.points_per_window = points;
        self
    }

    pub fn with_window_seconds(mut self, seconds: u64) -> Self {
        self.window_seconds = seconds;
        self
    }

    pub fn with_block_seconds(mut self, seconds: u64) -> Self {
        self.block_seconds = seconds;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.points_per_window == 0 {
            return Err(Error::Config("points_per_window must be > 0".to_string()));
        }
        if self.window_seconds == 0 {
            return Err(Error::Config("window_seconds must be > 0".to_string()));
        }
        if self.key_prefix.is_empty() || self.key_prefix.contains('\0') {
            return Err(Error::Config("key_prefix must be non-empty and free of NUL".to_string()));
        }
        Ok(())
    }

    fn policy(&self) -> WindowPolicy {
        WindowPolicy {
            points: self.points_per_window,
            window: Duration::from_secs(self.window_seconds),
            block: Duration::from_secs(self.block_seconds),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allowed,
    Denied,
}

/// Outcome of a single consume
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumeResult {
    pub decision: Decision,
    /// Points per window (the quota)
    pub limit: u32,
    /// Points used in the current window after this call
    pub consumed_points: u32,
    pub remaining_points: u32,
    /// Milliseconds until the key may consume again
    pub ms_before_next_window: u64,
    /// The store was unreachable and the decision came from the failure mode
    pub degraded: bool,
}

impl ConsumeResult {
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allowed
    }

    /// Whole seconds a denied caller should wait
    pub fn retry_after_secs(&self) -> u64 {
        self.ms_before_next_window.div_ceil(1000)
    }

    pub fn headers(&self) -> RateLimitHeaders {
        self.headers_at(Utc::now())
    }

    /// Standard rate-limit headers as of `now`
    pub fn headers_at(&self, now: DateTime<Utc>) -> RateLimitHeaders {
        let retry_after = self.retry_after_secs();
        let now_secs = (now.timestamp_millis().max(0) as u64).div_ceil(1000);
        RateLimitHeaders {
            limit: self.limit,
            remaining: self.remaining_points,
            reset_epoch_secs: now_secs + retry_after,
            retry_after_secs: (!self.is_allowed()).then_some(retry_after),
        }
    }
}

/// `X-RateLimit-*` and `Retry-After` header values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub limit: u32,
    pub remaining: u32,
    pub reset_epoch_secs: u64,
    /// Only set on a denial
    pub retry_after_secs: Option<u64>,
}

impl RateLimitHeaders {
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(4);
        if let Some(retry_after) = self.retry_after_secs {
            pairs.push(("Retry-After", retry_after.to_string()));
        }
        pairs.push(("X-RateLimit-Limit", self.limit.to_string()));
        pairs.push(("X-RateLimit-Remaining", self.remaining.to_string()));
        pairs.push(("X-RateLimit-Reset", self.reset_epoch_secs.to_string()));
        pairs
    }
}

/// Read-only view of a key's window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyStatus {
    pub key: String,
    pub consumed_points: u32,
    pub remaining_points: u32,
    pub ms_before_next_window: u64,
    pub blocked_ms: u64,
}

/// Rate limiter over a pluggable store
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use trading_guard::common::{InMemoryStore, LimiterConfig, RateLimiter};
///
/// #[tokio::main]
/// async fn main() -> trading_guard::Result<()> {
///     let config = LimiterConfig::default().with_points(3).with_window_seconds(60);
///     let limiter = RateLimiter::new(config, Arc::new(InMemoryStore::new()))?;
///
///     let result = limiter.consume("user:42", 1).await?;
///     assert!(result.is_allowed());
///     assert_eq!(result.remaining_points, 2);
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct RateLimiter {
    config: LimiterConfig,
    policy: WindowPolicy,
    store: Arc<dyn RateLimitStore>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("backend", &self.store.backend())
            .finish()
    }
}

impl RateLimiter {
    /// Create a limiter over `store`; fails on an invalid configuration
    pub fn new(config: LimiterConfig, store: Arc<dyn RateLimitStore>) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            "Rate limiter: {} points per {}s, block {}s, {} backend, {}",
            config.points_per_window,
            config.window_seconds,
            config.block_seconds,
            store.backend(),
            config.failure_mode
        );
        if store.backend() == "memory" {
            tracing::warn!("Rate limiter store is process-local; quotas are per instance");
        }
        Ok(Self {
            policy: config.policy(),
            config,
            store,
        })
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Points per window
    pub fn points(&self) -> u32 {
        self.config.points_per_window
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    fn check_input(key: &str, cost: u32) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("rate limit key must not be empty".to_string()));
        }
        // NUL separates counters from block markers in the redis store
        if key.contains('\0') {
            return Err(Error::InvalidArgument("rate limit key must not contain NUL".to_string()));
        }
        if cost == 0 {
            return Err(Error::InvalidArgument("cost must be positive".to_string()));
        }
        Ok(())
    }

    /// Consume `cost` points for `key` using the configured failure mode
    pub async fn consume(&self, key: &str, cost: u32) -> Result<ConsumeResult> {
        self.consume_with(key, cost, self.config.failure_mode).await
    }

    /// Consume with an explicit failure mode for this call site
    pub async fn consume_with(
        &self,
        key: &str,
        cost: u32,
        failure_mode: FailureMode,
    ) -> Result<ConsumeResult> {
        Self::check_input(key, cost)?;
        let store_key = self.store_key(key);

        match self.store.consume(&store_key, cost, &self.policy).await {
            Ok(outcome) => {
                let now = Instant::now();
                let record = &outcome.record;
                let remaining = if record.is_blocked(now) {
                    0
                } else {
                    self.points().saturating_sub(record.points_consumed)
                };
                let result = ConsumeResult {
                    decision: if outcome.allowed {
                        Decision::Allowed
                    } else {
                        Decision::Denied
                    },
                    limit: self.points(),
                    consumed_points: record.points_consumed,
                    remaining_points: remaining,
                    ms_before_next_window: record.ms_before_next(now),
                    degraded: false,
                };
                if !result.is_allowed() {
                    tracing::debug!(
                        "Rate limit hit for {} (cost {}), retry in {}ms",
                        store_key,
                        cost,
                        result.ms_before_next_window
                    );
                }
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(
                    "Rate limit store error for {}, applying {}: {}",
                    store_key,
                    failure_mode,
                    e
                );
                Ok(self.degraded(failure_mode))
            }
        }
    }

    /// Like [`consume`](Self::consume) but a denial is an
    /// [`Error::QuotaExceeded`]
    pub async fn consume_or_reject(&self, key: &str, cost: u32) -> Result<ConsumeResult> {
        let result = self.consume(key, cost).await?;
        if result.is_allowed() {
            Ok(result)
        } else {
            Err(Error::QuotaExceeded {
                limit: result.limit,
                remaining: result.remaining_points,
                retry_after_ms: result.ms_before_next_window,
            })
        }
    }

    /// Current window for `key` without consuming; `None` means untouched
    pub async fn status(&self, key: &str) -> Result<Option<KeyStatus>> {
        let store_key = self.store_key(key);
        let Some(record) = self.store.get(&store_key).await? else {
            return Ok(None);
        };
        let now = Instant::now();
        let consumed = if record.window_expired(now) {
            0
        } else {
            record.points_consumed
        };
        Ok(Some(KeyStatus {
            key: key.to_string(),
            consumed_points: consumed,
            remaining_points: if record.is_blocked(now) {
                0
            } else {
                self.points().saturating_sub(consumed)
            },
            ms_before_next_window: record.ms_before_next(now),
            blocked_ms: record.blocked_ms(now),
        }))
    }

    /// Forget `key`, restoring its full quota
    pub async fn reset(&self, key: &str) -> Result<()> {
        let store_key = self.store_key(key);
        self.store.delete(&store_key).await?;
        tracing::info!("Rate limit reset for {}", store_key);
        Ok(())
    }

    fn degraded(&self, failure_mode: FailureMode) -> ConsumeResult {
        match failure_mode {
            FailureMode::FailOpen => ConsumeResult {
                decision: Decision::Allowed,
                limit: self.points(),
                consumed_points: 0,
                remaining_points: self.points(),
                ms_before_next_window: 0,
                degraded: true,
            },
            FailureMode::FailClosed => ConsumeResult {
                decision: Decision::Denied,
                limit: self.points(),
                consumed_points: 0,
                remaining_points: 0,
                ms_before_next_window: self.policy.window.as_millis() as u64,
                degraded: true,
            },
        }
    }
}
