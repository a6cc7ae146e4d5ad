//! MEXC public market data client
//!
//! Every request goes through the injected [`CircuitBreaker`]. Transport
//! errors, non-2xx responses and undecodable bodies all count as failures;
//! once the breaker opens, calls fail fast with
//! [`BreakerError::Open`](crate::error::BreakerError::Open) until the reset
//! timeout allows a trial.
//!
//! The HTTP timeout configured here is what bounds a hung request; the
//! breaker itself never times out a call.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use trading_guard::common::CircuitBreaker;
//! use trading_guard::mexc::{ClientConfig, MexcClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let breaker = Arc::new(CircuitBreaker::with_defaults("mexc"));
//!     let client = MexcClient::new(ClientConfig::default(), breaker)?;
//!     let ticker = client.get_price("BTCUSDT").await?;
//!     println!("BTC/USDT: {}", ticker.price);
//!     Ok(())
//! }
//! ```

use reqwest::Client;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use super::error::{MexcError, MexcResult};
use super::types::{PriceTicker, Ticker24hr};
use crate::common::CircuitBreaker;

/// Base URL for the MEXC REST API
pub const DEFAULT_BASE_URL: &str = "https://api.mexc.com";

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    /// Request timeout duration
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// MEXC spot API client guarded by a circuit breaker
#[derive(Debug, Clone)]
pub struct MexcClient {
    http_client: Client,
    base_url: String,
    breaker: Arc<CircuitBreaker>,
}

impl MexcClient {
    pub fn new(config: ClientConfig, breaker: Arc<CircuitBreaker>) -> Result<Self, MexcError> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        Ok(Self {
            http_client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            breaker,
        })
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    async fn get_json<R>(&self, path: &str, query: &[(&str, String)]) -> MexcResult<R>
    where
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let request = self.http_client.get(&url).query(query);

        self.breaker
            .execute(|| async move {
                tracing::debug!("MEXC API request: GET {}", url);
                let response = request.send().await?;
                let status = response.status();
                let text = response.text().await?;

                if !status.is_success() {
                    return Err(MexcError::Api {
                        status: status.as_u16(),
                        body: text,
                    });
                }
                Ok(serde_json::from_str(&text)?)
            })
            .await
    }

    /// Connectivity check (`GET /api/v3/ping`)
    pub async fn ping(&self) -> MexcResult<()> {
        self.get_json::<serde_json::Value>("/api/v3/ping", &[])
            .await
            .map(|_| ())
    }

    /// Latest price for a trading pair, e.g. `BTCUSDT`
    pub async fn get_price(&self, symbol: &str) -> MexcResult<PriceTicker> {
        self.get_json("/api/v3/ticker/price", &[("symbol", symbol.to_uppercase())])
            .await
    }

    /// 24h rolling statistics for a trading pair
    pub async fn get_ticker_24hr(&self, symbol: &str) -> MexcResult<Ticker24hr> {
        self.get_json("/api/v3/ticker/24hr", &[("symbol", symbol.to_uppercase())])
            .await
    }
}
