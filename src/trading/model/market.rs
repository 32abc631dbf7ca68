use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 规范化后的价格事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub last_traded_price: f64,
    pub observed_at: DateTime<Utc>,
}

impl PriceTick {
    pub fn new(symbol: impl Into<String>, last_traded_price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            last_traded_price,
            observed_at: Utc::now(),
        }
    }
}

/// 券商原始行情（各家格式不同，由行情接入层统一规范化）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTick {
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl RawTick {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            received_at: Utc::now(),
        }
    }
}

/// 券商行情回调转成的内部消息
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Tick(RawTick),
    /// 连接断开，携带原因
    Disconnected(String),
}
