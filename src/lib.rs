//! Trading Guard
//!
//! Resilience layer for a crypto trading dashboard API:
//!
//! - **Rate limiting** at the ingress: a per-key rolling-window quota
//!   ([`common::RateLimiter`]) over a pluggable store, either process-local
//!   ([`common::InMemoryStore`]) or shared through Redis
//!   ([`common::RedisStore`]). Store outages resolve to an explicit
//!   fail-open or fail-closed decision. Sensitive endpoint classes can get
//!   quotas of their own through [`common::RateLimiterSet`].
//! - **Circuit breaking** at the egress: [`common::CircuitBreaker`] wraps
//!   each unreliable outbound call site, trips after consecutive failures
//!   and probes recovery with a single half-open trial.
//!
//! Both are plain values constructed at startup and passed to whatever
//! needs them; there are no process-wide singletons.
//!
//! ## Rate limiting a request
//! ```
//! use std::sync::Arc;
//! use trading_guard::common::{InMemoryStore, LimiterConfig, RateLimiter};
//! use trading_guard::ingress::{derive_key, Rejection};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let limiter = RateLimiter::new(
//!         LimiterConfig::default().with_points(2),
//!         Arc::new(InMemoryStore::new()),
//!     )?;
//!
//!     let key = derive_key(None, Some("203.0.113.7, 10.0.0.1"), None);
//!     limiter.consume(&key, 2).await?;
//!
//!     let result = limiter.consume(&key, 1).await?;
//!     let rejection = Rejection::from_quota(&result).expect("quota is used up");
//!     assert_eq!(rejection.status, 429);
//!     Ok(())
//! }
//! ```
//!
//! ## Protecting an exchange call
//! ```no_run
//! use std::sync::Arc;
//! use trading_guard::common::CircuitBreaker;
//! use trading_guard::mexc::{ClientConfig, MexcClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let breaker = Arc::new(CircuitBreaker::with_defaults("mexc"));
//!     let client = MexcClient::new(ClientConfig::default(), breaker.clone())?;
//!
//!     match client.get_price("BTCUSDT").await {
//!         Ok(ticker) => println!("BTC/USDT: {}", ticker.price),
//!         Err(e) if e.is_circuit_open() => println!("MEXC unavailable: {}", e),
//!         Err(e) => println!("MEXC call failed: {}", e),
//!     }
//!     println!("{}", serde_json::to_string_pretty(&breaker.status())?);
//!     Ok(())
//! }
//! ```

pub mod common;
pub mod config;
pub mod error;
pub mod ingress;
pub mod mexc;

pub use config::Config;
pub use error::{BreakerError, CircuitOpenError, Error, Result, StoreError};
