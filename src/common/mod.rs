//! Resilience primitives shared by the API edge and the exchange clients
//!
//! - Rate limiter with per-key rolling windows over a pluggable store
//! - Separate quotas per endpoint class over one store
//! - In-memory and Redis quota stores
//! - Circuit breaker for outbound calls, plus a registry of named breakers

pub mod circuit_breaker;
pub mod limiter_set;
pub mod memory_store;
pub mod rate_limiter;
pub mod redis_store;
pub mod registry;
pub mod store;

pub use circuit_breaker::{
    BreakerStats, BreakerStatus, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use limiter_set::{RateLimiterSet, RateLimiterSetBuilder, DEFAULT_CLASS};
pub use memory_store::InMemoryStore;
pub use rate_limiter::{
    ConsumeResult, Decision, FailureMode, KeyStatus, LimiterConfig, RateLimitHeaders, RateLimiter,
};
pub use redis_store::RedisStore;
pub use registry::BreakerRegistry;
pub use store::{ConsumptionRecord, RateLimitStore, StoreOutcome, WindowPolicy};
