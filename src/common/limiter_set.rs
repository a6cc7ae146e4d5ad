//! Rate limiters per endpoint class
//!
//! Expensive or sensitive endpoints (order placement, balance checks) get a
//! quota of their own instead of sharing the general API quota. Every class
//! runs over the same store but in its own key namespace,
//! `{prefix}:{class}:{key}`, so exhausting `order_create` leaves `ticker`
//! untouched for the same caller.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::rate_limiter::{ConsumeResult, LimiterConfig, RateLimiter};
use super::store::RateLimitStore;
use crate::error::{Error, Result};

/// Name under which the general limiter is addressed
pub const DEFAULT_CLASS: &str = "default";

/// The general limiter plus one limiter per named class
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use trading_guard::common::{InMemoryStore, LimiterConfig, RateLimiterSet};
///
/// #[tokio::main]
/// async fn main() -> trading_guard::Result<()> {
///     let base = LimiterConfig::default().with_points(30);
///     let limiters = RateLimiterSet::builder(base, Arc::new(InMemoryStore::new()))
///         .class("order_create", LimiterConfig::default().with_points(10))
///         .class("ticker", LimiterConfig::default().with_points(60))
///         .build()?;
///
///     let result = limiters.consume("order_create", "user:42", 1).await?;
///     assert_eq!(result.remaining_points, 9);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct RateLimiterSet {
    default: RateLimiter,
    classes: BTreeMap<String, RateLimiter>,
}

pub struct RateLimiterSetBuilder {
    base: LimiterConfig,
    store: Arc<dyn RateLimitStore>,
    classes: Vec<(String, LimiterConfig)>,
}

impl RateLimiterSetBuilder {
    /// Add a class; its key prefix is derived from the base prefix
    pub fn class(mut self, name: impl Into<String>, config: LimiterConfig) -> Self {
        self.classes.push((name.into(), config));
        self
    }

    pub fn build(self) -> Result<RateLimiterSet> {
        let default = RateLimiter::new(self.base.clone(), self.store.clone())?;
        let mut classes = BTreeMap::new();

        for (name, config) in self.classes {
            validate_class_name(&name)?;
            if classes.contains_key(&name) {
                return Err(Error::Config(format!("duplicate limit class '{}'", name)));
            }
            let config = config.with_key_prefix(class_prefix(&self.base.key_prefix, &name));
            tracing::debug!("Limit class '{}' uses key prefix {}", name, config.key_prefix);
            let limiter = RateLimiter::new(config, self.store.clone())?;
            classes.insert(name, limiter);
        }

        Ok(RateLimiterSet { default, classes })
    }
}

fn class_prefix(base_prefix: &str, class: &str) -> String {
    format!("{}:{}", base_prefix, class)
}

pub(crate) fn validate_class_name(name: &str) -> Result<()> {
    if name == DEFAULT_CLASS {
        return Err(Error::Config(format!(
            "'{}' is the general limiter and cannot be redefined as a class",
            DEFAULT_CLASS
        )));
    }
    if name.is_empty() || name.contains(':') || name.chars().any(char::is_whitespace) {
        return Err(Error::Config(format!("invalid limit class name '{}'", name)));
    }
    Ok(())
}

impl RateLimiterSet {
    pub fn builder(base: LimiterConfig, store: Arc<dyn RateLimitStore>) -> RateLimiterSetBuilder {
        RateLimiterSetBuilder {
            base,
            store,
            classes: Vec::new(),
        }
    }

    pub fn default_limiter(&self) -> &RateLimiter {
        &self.default
    }

    /// Limiter for `class`; [`DEFAULT_CLASS`] is the general limiter
    pub fn get(&self, class: &str) -> Option<&RateLimiter> {
        if class == DEFAULT_CLASS {
            Some(&self.default)
        } else {
            self.classes.get(class)
        }
    }

    /// Like [`get`](Self::get) but an unknown class is an error
    pub fn limiter(&self, class: &str) -> Result<&RateLimiter> {
        self.get(class)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown limit class '{}'", class)))
    }

    /// Configured class names, without the general limiter
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(String::as_str)
    }

    pub async fn consume(&self, class: &str, key: &str, cost: u32) -> Result<ConsumeResult> {
        self.limiter(class)?.consume(key, cost).await
    }

    /// Forget `key` in `class` only
    pub async fn reset(&self, class: &str, key: &str) -> Result<()> {
        self.limiter(class)?.reset(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::InMemoryStore;

    fn set() -> RateLimiterSet {
        RateLimiterSet::builder(
            LimiterConfig::default().with_points(30).with_key_prefix("mexc"),
            Arc::new(InMemoryStore::new()),
        )
        .class("order_create", LimiterConfig::default().with_points(2))
        .class("ticker", LimiterConfig::default().with_points(5))
        .build()
        .unwrap()
    }

    async fn allowed(limiters: &RateLimiterSet, class: &str) -> bool {
        limiters.consume(class, "user:1", 1).await.unwrap().is_allowed()
    }

    #[test]
    fn test_class_prefixes() {
        let limiters = set();
        assert_eq!(limiters.default_limiter().config().key_prefix, "mexc");
        assert_eq!(
            limiters.get("order_create").unwrap().config().key_prefix,
            "mexc:order_create"
        );
        assert_eq!(limiters.get("ticker").unwrap().points(), 5);
        assert_eq!(limiters.get(DEFAULT_CLASS).unwrap().points(), 30);
        let classes: Vec<_> = limiters.classes().collect();
        assert_eq!(classes, vec!["order_create", "ticker"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_classes_have_independent_quotas() {
        let limiters = set();

        assert!(allowed(&limiters, "order_create").await);
        assert!(allowed(&limiters, "order_create").await);
        assert!(!allowed(&limiters, "order_create").await);

        let ticker = limiters.consume("ticker", "user:1", 1).await.unwrap();
        assert!(ticker.is_allowed());
        assert_eq!(ticker.remaining_points, 4);

        let general = limiters.consume(DEFAULT_CLASS, "user:1", 1).await.unwrap();
        assert_eq!(general.remaining_points, 29);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_only_touches_one_class() {
        let limiters = set();
        limiters.consume("order_create", "user:1", 2).await.unwrap();
        limiters.consume("ticker", "user:1", 5).await.unwrap();

        limiters.reset("order_create", "user:1").await.unwrap();
        assert!(allowed(&limiters, "order_create").await);
        assert!(!allowed(&limiters, "ticker").await);
    }

    #[tokio::test]
    async fn test_unknown_class_is_rejected() {
        let limiters = set();
        let err = limiters.consume("withdraw", "user:1", 1).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_invalid_class_names() {
        let store: Arc<dyn RateLimitStore> = Arc::new(InMemoryStore::new());
        for name in ["default", "", "a:b", "has space"] {
            let result = RateLimiterSet::builder(LimiterConfig::default(), store.clone())
                .class(name, LimiterConfig::default())
                .build();
            assert!(matches!(result, Err(Error::Config(_))), "{:?} accepted", name);
        }

        let duplicate = RateLimiterSet::builder(LimiterConfig::default(), store)
            .class("ticker", LimiterConfig::default())
            .class("ticker", LimiterConfig::default().with_points(5))
            .build();
        assert!(duplicate.is_err());
    }
}
