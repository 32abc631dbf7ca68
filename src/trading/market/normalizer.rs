//! 券商原始行情 -> PriceTick

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::warn;

use crate::trading::model::{PriceTick, RawTick};

const SYMBOL_FIELDS: [&str; 5] = [
    "symbol",
    "tradingsymbol",
    "trading_symbol",
    "security_id",
    "securityId",
];
const PRICE_FIELDS: [&str; 5] = ["ltp", "last_traded_price", "LTP", "last_price", "last"];
const TIME_FIELDS: [&str; 4] = ["ts", "exch_feed_time", "exchange_timestamp", "timestamp"];

/// 秒与毫秒的分界
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// 数字或数字字符串
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

fn first_field<'a>(payload: &'a Value, fields: &[&str]) -> Option<&'a Value> {
    fields
        .iter()
        .map(|field| &payload[*field])
        .find(|value| !value.is_null())
}

fn parse_symbol(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value_as_f64(value)? as i64;
    if raw <= 0 {
        return None;
    }
    if raw >= MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(raw).single()
    } else {
        Utc.timestamp_opt(raw, 0).single()
    }
}

/// 解析失败返回 None 并记录告警，调用方直接丢弃
pub fn normalize_tick(raw: &RawTick) -> Option<PriceTick> {
    let payload = &raw.payload;
    let symbol = first_field(payload, &SYMBOL_FIELDS).and_then(parse_symbol);
    let price = first_field(payload, &PRICE_FIELDS).and_then(value_as_f64);

    match (symbol, price) {
        (Some(symbol), Some(price)) if price > 0.0 => {
            let observed_at = first_field(payload, &TIME_FIELDS)
                .and_then(parse_timestamp)
                .unwrap_or(raw.received_at);
            Some(PriceTick {
                symbol,
                last_traded_price: price,
                observed_at,
            })
        }
        _ => {
            warn!("丢弃无法解析的行情: {}", payload);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use serde_json::json;

    #[test]
    fn test_aliases_and_numeric_strings() {
        let tick = normalize_tick(&RawTick::new(json!({
            "tradingsymbol": "RELIANCE",
            "LTP": "2490.5",
            "exch_feed_time": 1_704_860_000_000i64,
        })))
        .unwrap();
        assert_eq!(tick.symbol, "RELIANCE");
        assert_relative_eq!(tick.last_traded_price, 2490.5);
        assert_eq!(tick.observed_at.timestamp(), 1_704_860_000);

        let tick = normalize_tick(&RawTick::new(json!({
            "security_id": 2885,
            "last_traded_price": 2600,
            "ts": 1_704_860_000i64,
        })))
        .unwrap();
        assert_eq!(tick.symbol, "2885");
        assert_eq!(tick.observed_at.timestamp(), 1_704_860_000);
    }

    #[test]
    fn test_missing_timestamp_uses_receive_time() {
        let raw = RawTick::new(json!({"symbol": "TCS", "ltp": 3500.0}));
        let tick = normalize_tick(&raw).unwrap();
        assert_eq!(tick.observed_at, raw.received_at);
    }

    #[test]
    fn test_malformed_ticks_are_dropped() {
        assert!(normalize_tick(&RawTick::new(json!({"ltp": 10.0}))).is_none());
        assert!(normalize_tick(&RawTick::new(json!({"symbol": "TCS", "ltp": "n/a"}))).is_none());
        assert!(normalize_tick(&RawTick::new(json!({"symbol": "TCS", "ltp": -1}))).is_none());
        assert!(normalize_tick(&RawTick::new(json!("heartbeat"))).is_none());
    }
}
