//! MEXC spot API response types
//!
//! MEXC encodes decimals as JSON strings; they are parsed into `f64` here.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => s.parse().map_err(de::Error::custom),
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| de::Error::custom("number out of range")),
        other => Err(de::Error::custom(format!("expected a number, got {}", other))),
    }
}

/// `GET /api/v3/ticker/price`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTicker {
    pub symbol: String,
    #[serde(deserialize_with = "de_f64")]
    pub price: f64,
}

/// `GET /api/v3/ticker/24hr`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker24hr {
    pub symbol: String,
    #[serde(deserialize_with = "de_f64")]
    pub price_change: f64,
    #[serde(deserialize_with = "de_f64")]
    pub price_change_percent: f64,
    #[serde(deserialize_with = "de_f64")]
    pub last_price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub high_price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub low_price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub volume: f64,
    #[serde(deserialize_with = "de_f64")]
    pub quote_volume: f64,
    #[serde(default)]
    pub open_time: i64,
    #[serde(default)]
    pub close_time: i64,
}
