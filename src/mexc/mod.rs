//! MEXC Exchange API Library
//!
//! Public market data endpoints of the MEXC spot API (no API key needed),
//! each call protected by a circuit breaker.
//!
//! # Environment Variables
//!
//! - `MEXC_BASE_URL` overrides the API host (default `https://api.mexc.com`)
//! - `MEXC_TIMEOUT_MS` overrides the per-request timeout (default 8000)

pub mod client;
pub mod error;
pub mod types;

pub use client::{ClientConfig, MexcClient, DEFAULT_BASE_URL};
pub use error::{MexcError, MexcResult};
pub use types::{PriceTicker, Ticker24hr};
