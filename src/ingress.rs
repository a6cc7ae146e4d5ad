//! Request-edge helpers
//!
//! The HTTP framework is not part of this crate. These helpers cover what
//! every handler needs around the limiter and the breakers: picking the
//! quota key, looking up a route's cost and turning a rejection into a
//! status code, headers and JSON body.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

use crate::common::ConsumeResult;
use crate::error::CircuitOpenError;

/// Quota key for a request
///
/// Priority: authenticated user id, then the first `X-Forwarded-For`
/// entry, then the transport address.
pub fn derive_key(
    user_id: Option<&str>,
    forwarded_for: Option<&str>,
    remote_addr: Option<&str>,
) -> String {
    if let Some(user) = non_empty(user_id) {
        return format!("user:{}", user);
    }
    let forwarded = forwarded_for.and_then(|header| non_empty(header.split(',').next()));
    if let Some(ip) = forwarded.or_else(|| non_empty(remote_addr)) {
        return format!("ip:{}", ip);
    }
    "unknown".to_string()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Point cost per route; routes not listed cost the default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteCosts {
    #[serde(default = "default_cost")]
    pub default_cost: u32,
    #[serde(default)]
    pub routes: HashMap<String, u32>,
}

fn default_cost() -> u32 {
    1
}

impl Default for RouteCosts {
    fn default() -> Self {
        Self {
            default_cost: default_cost(),
            routes: HashMap::new(),
        }
    }
}

impl RouteCosts {
    pub fn with_route(mut self, route: impl Into<String>, cost: u32) -> Self {
        self.routes.insert(route.into(), cost);
        self
    }

    pub fn cost_for(&self, route: &str) -> u32 {
        self.routes.get(route).copied().unwrap_or(self.default_cost).max(1)
    }
}

/// A response the edge should send instead of running the handler
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: serde_json::Value,
}

impl Rejection {
    /// 429 for a denied consume, `None` if the request was allowed
    pub fn from_quota(result: &ConsumeResult) -> Option<Self> {
        Self::from_quota_at(result, Utc::now())
    }

    pub fn from_quota_at(result: &ConsumeResult, now: DateTime<Utc>) -> Option<Self> {
        if result.is_allowed() {
            return None;
        }
        let headers = result.headers_at(now);
        Some(Self {
            status: 429,
            body: json!({
                "success": false,
                "error": "Too Many Requests",
                "retryAfter": result.retry_after_secs(),
            }),
            headers: headers.to_pairs(),
        })
    }

    /// 503 for a call the breaker refused
    pub fn from_circuit_open(err: &CircuitOpenError) -> Self {
        Self {
            status: 503,
            headers: vec![("Retry-After", err.retry_after_secs.to_string())],
            body: json!({
                "success": false,
                "error": "Service Unavailable",
                "message": err.to_string(),
                "retryAfter": err.retry_after_secs,
            }),
        }
    }
}
