//! Redis-backed quota store
//!
//! The check-and-increment runs as one Lua script on the Redis server, so
//! every process pointed at the same Redis shares one quota per key.
//!
//! Key layout, for a limiter key `rl:api:u1`:
//! - `rl:api:u1`         consumed points, `PX` = window length
//! - `rl:api:u1\0block`  present while the key is blocked, `PX` = block length
//!
//! The NUL separator keeps block markers out of the counter namespace;
//! [`RateLimiter`](super::RateLimiter) refuses keys containing NUL.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use super::store::{ConsumptionRecord, RateLimitStore, StoreOutcome, WindowPolicy};
use crate::error::StoreError;

/// Default bound on a single Redis round trip
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(500);

// KEYS[1] counter, KEYS[2] block marker
// ARGV[1] cost, ARGV[2] points, ARGV[3] window ms, ARGV[4] block ms
// Returns {allowed, consumed, window pttl, block pttl}
const CONSUME_SCRIPT: &str = r#"
local cost     = tonumber(ARGV[1])
local points   = tonumber(ARGV[2])
local windowMs = tonumber(ARGV[3])
local blockMs  = tonumber(ARGV[4])

local consumed = tonumber(redis.call('GET', KEYS[1]) or '0')
local ttl = redis.call('PTTL', KEYS[1])
if ttl <= 0 then
  consumed = 0
  ttl = windowMs
end

local blockTtl = redis.call('PTTL', KEYS[2])
if blockTtl > 0 then
  return {0, consumed, ttl, blockTtl}
end

if consumed + cost <= points then
  consumed = consumed + cost
  redis.call('SET', KEYS[1], consumed, 'PX', ttl)
  return {1, consumed, ttl, 0}
end

if blockMs > 0 then
  redis.call('SET', KEYS[2], 1, 'PX', blockMs)
  return {0, consumed, ttl, blockMs}
end
return {0, consumed, ttl, 0}
"#;

fn block_key(key: &str) -> String {
    format!("{}\0block", key)
}

/// Build a record from the TTLs Redis reported
fn record_from_ttls(
    key: &str,
    consumed: i64,
    window_ttl_ms: i64,
    block_ttl_ms: i64,
) -> ConsumptionRecord {
    let now = Instant::now();
    ConsumptionRecord {
        key: key.to_string(),
        points_consumed: consumed.clamp(0, u32::MAX as i64) as u32,
        window_expires_at: now + Duration::from_millis(window_ttl_ms.max(0) as u64),
        blocked_until: (block_ttl_ms > 0).then(|| now + Duration::from_millis(block_ttl_ms as u64)),
    }
}

/// [`RateLimitStore`] shared through Redis
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    script: Script,
    op_timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://localhost:6379`)
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_timeout(url, DEFAULT_OP_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        url: &str,
        op_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection = tokio::time::timeout(op_timeout * 10, ConnectionManager::new(client))
            .await
            .map_err(|_| StoreError::Unavailable(format!("timed out connecting to {}", url)))??;

        tracing::info!("Redis rate limit store connected");
        Ok(Self {
            connection,
            script: Script::new(CONSUME_SCRIPT),
            op_timeout,
        })
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Unavailable(format!(
                "redis operation timed out after {}ms",
                self.op_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn consume(
        &self,
        key: &str,
        cost: u32,
        policy: &WindowPolicy,
    ) -> Result<StoreOutcome, StoreError> {
        let mut conn = self.connection.clone();
        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(key)
            .key(block_key(key))
            .arg(cost)
            .arg(policy.points)
            .arg(policy.window.as_millis() as u64)
            .arg(policy.block.as_millis() as u64);

        let reply: Vec<i64> = self.bounded(invocation.invoke_async(&mut conn)).await?;
        let [allowed, consumed, window_ttl, block_ttl] = reply[..] else {
            return Err(StoreError::Protocol(format!(
                "expected 4 integers from consume script, got {:?}",
                reply
            )));
        };

        Ok(StoreOutcome {
            allowed: allowed == 1,
            record: record_from_ttls(key, consumed, window_ttl, block_ttl),
        })
    }

    async fn get(&self, key: &str) -> Result<Option<ConsumptionRecord>, StoreError> {
        let mut conn = self.connection.clone();
        let mut pipe = redis::pipe();
        pipe.get(key).pttl(key).pttl(block_key(key));

        let (consumed, window_ttl, block_ttl): (Option<i64>, i64, i64) =
            self.bounded(pipe.query_async(&mut conn)).await?;

        let live_window = consumed.is_some() && window_ttl > 0;
        if !live_window && block_ttl <= 0 {
            return Ok(None);
        }
        let consumed = if live_window { consumed.unwrap_or(0) } else { 0 };
        Ok(Some(record_from_ttls(key, consumed, window_ttl, block_ttl)))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key).arg(block_key(key));
        let _: i64 = self.bounded(cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
