//! Configuration management
//!
//! Settings come from an optional JSON file, then environment variables
//! override individual values. Everything the limiter and the breakers need
//! is passed in at construction; nothing is read from the environment
//! after startup.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::common::limiter_set::validate_class_name;
use crate::common::{
    CircuitBreakerConfig, FailureMode, InMemoryStore, LimiterConfig, RateLimitStore,
    RateLimiterSet, RedisStore,
};
use crate::ingress::RouteCosts;
use crate::mexc::ClientConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The general API quota
    pub rate_limit: RateLimitSettings,
    /// Endpoint classes with a quota of their own, e.g. `order_create`
    pub limits: BTreeMap<String, LimitClassSettings>,
    pub store: StoreSettings,
    pub breaker: BreakerSettings,
    pub exchange: ExchangeSettings,
    pub route_costs: RouteCosts,
}

/// Rate limiter settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub points: u32,
    pub window_seconds: u64,
    pub block_seconds: u64,
    pub key_prefix: String,
    pub failure_mode: FailureMode,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let defaults = LimiterConfig::default();
        RateLimitSettings {
            points: defaults.points_per_window,
            window_seconds: defaults.window_seconds,
            block_seconds: defaults.block_seconds,
            key_prefix: defaults.key_prefix,
            failure_mode: defaults.failure_mode,
        }
    }
}

/// Quota for one endpoint class
///
/// Keys live under `{rate_limit.key_prefix}:{class}`. The failure mode
/// defaults to the general one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitClassSettings {
    pub points: u32,
    #[serde(default = "default_class_window")]
    pub window_seconds: u64,
    #[serde(default)]
    pub block_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_mode: Option<FailureMode>,
}

fn default_class_window() -> u64 {
    60
}

impl LimitClassSettings {
    pub fn new(points: u32, window_seconds: u64) -> Self {
        Self {
            points,
            window_seconds,
            block_seconds: 0,
            failure_mode: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => bail!("unknown store backend '{}', expected memory or redis", other),
        }
    }
}

/// Quota store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    /// Use the in-memory store if Redis cannot be reached at startup
    pub fallback_to_memory: bool,
    pub op_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            backend: StoreBackend::Memory,
            redis_url: None,
            fallback_to_memory: false,
            op_timeout_ms: 500,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        BreakerSettings {
            failure_threshold: 3,
            reset_timeout_ms: 30_000,
        }
    }
}

/// Exchange client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeSettings {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for ExchangeSettings {
    fn default() -> Self {
        let defaults = ClientConfig::default();
        ExchangeSettings {
            base_url: defaults.base_url,
            timeout_ms: defaults.timeout.as_millis() as u64,
        }
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid {}='{}': {}", name, raw, e)),
        Err(_) => Ok(None),
    }
}

impl Config {
    /// Load configuration from JSON file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override settings from environment variables that are set
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(points) = env_parse("RATE_LIMIT_POINTS")? {
            self.rate_limit.points = points;
        }
        if let Some(window) = env_parse("RATE_LIMIT_WINDOW_SECS")? {
            self.rate_limit.window_seconds = window;
        }
        if let Some(block) = env_parse("RATE_LIMIT_BLOCK_SECS")? {
            self.rate_limit.block_seconds = block;
        }
        if let Ok(prefix) = std::env::var("RATE_LIMIT_KEY_PREFIX") {
            self.rate_limit.key_prefix = prefix;
        }
        if let Some(mode) = env_parse("RATE_LIMIT_FAILURE_MODE")? {
            self.rate_limit.failure_mode = mode;
        }
        if let Some(backend) = env_parse("RATE_LIMIT_STORE")? {
            self.store.backend = backend;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.store.redis_url = Some(url);
        }
        if let Some(fallback) = env_parse("REDIS_FALLBACK_TO_MEMORY")? {
            self.store.fallback_to_memory = fallback;
        }
        if let Some(threshold) = env_parse("BREAKER_FAILURE_THRESHOLD")? {
            self.breaker.failure_threshold = threshold;
        }
        if let Some(timeout) = env_parse("BREAKER_RESET_TIMEOUT_MS")? {
            self.breaker.reset_timeout_ms = timeout;
        }
        if let Ok(url) = std::env::var("MEXC_BASE_URL") {
            self.exchange.base_url = url;
        }
        if let Some(timeout) = env_parse("MEXC_TIMEOUT_MS")? {
            self.exchange.timeout_ms = timeout;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.limiter_config()
            .validate()
            .context("Invalid rate_limit section")?;
        for (name, class) in &self.limits {
            validate_class_name(name)?;
            self.class_limiter_config(class)
                .validate()
                .with_context(|| format!("Invalid limits.{} section", name))?;
        }
        if self.breaker.failure_threshold == 0 {
            bail!("breaker.failure_threshold must be > 0");
        }
        if self.breaker.reset_timeout_ms == 0 {
            bail!("breaker.reset_timeout_ms must be > 0");
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            bail!("store.redis_url (or REDIS_URL) is required for the redis backend");
        }
        if self.store.op_timeout_ms == 0 {
            bail!("store.op_timeout_ms must be > 0");
        }
        Ok(())
    }

    pub fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig::default()
            .with_points(self.rate_limit.points)
            .with_window_seconds(self.rate_limit.window_seconds)
            .with_block_seconds(self.rate_limit.block_seconds)
            .with_key_prefix(self.rate_limit.key_prefix.clone())
            .with_failure_mode(self.rate_limit.failure_mode)
    }

    fn class_limiter_config(&self, class: &LimitClassSettings) -> LimiterConfig {
        LimiterConfig::default()
            .with_points(class.points)
            .with_window_seconds(class.window_seconds)
            .with_block_seconds(class.block_seconds)
            .with_failure_mode(class.failure_mode.unwrap_or(self.rate_limit.failure_mode))
    }

    /// The general limiter plus one limiter per `limits` entry, all over `store`
    pub fn limiters(&self, store: Arc<dyn RateLimitStore>) -> Result<RateLimiterSet> {
        let builder = self.limits.iter().fold(
            RateLimiterSet::builder(self.limiter_config(), store),
            |builder, (name, class)| builder.class(name.clone(), self.class_limiter_config(class)),
        );
        Ok(builder.build()?)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_failure_threshold(self.breaker.failure_threshold)
            .with_reset_timeout(Duration::from_millis(self.breaker.reset_timeout_ms))
    }

    pub fn exchange_config(&self) -> ClientConfig {
        ClientConfig::default()
            .with_base_url(self.exchange.base_url.clone())
            .with_timeout(Duration::from_millis(self.exchange.timeout_ms))
    }

    /// Pick the quota store once, at startup
    pub async fn build_store(&self) -> Result<Arc<dyn RateLimitStore>> {
        match self.store.backend {
            StoreBackend::Memory => Ok(Arc::new(InMemoryStore::new())),
            StoreBackend::Redis => {
                let url = self
                    .store
                    .redis_url
                    .as_deref()
                    .context("store.redis_url is not set")?;
                let op_timeout = Duration::from_millis(self.store.op_timeout_ms);
                match RedisStore::connect_with_timeout(url, op_timeout).await {
                    Ok(store) => Ok(Arc::new(store)),
                    Err(e) if self.store.fallback_to_memory => {
                        tracing::warn!(
                            "Redis unavailable ({}), falling back to in-memory rate limit store",
                            e
                        );
                        Ok(Arc::new(InMemoryStore::new()))
                    }
                    Err(e) => Err(e).context("Failed to connect to Redis rate limit store"),
                }
            }
        }
    }
}
