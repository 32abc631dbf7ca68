use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{OrderAction, OrderSide, OrderStatus};

/// 下单意图，由执行引擎构造并交给券商适配器
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub strategy_id: String,
    pub user_id: String,
    pub symbol: String,
    pub action: OrderAction,
    pub side: OrderSide,
    pub quantity: u32,
    /// None 表示市价单
    pub limit_price: Option<f64>,
    /// 客户端订单号，重试期间保持不变，券商侧可据此去重
    pub client_order_id: String,
}

impl OrderIntent {
    pub fn market(
        strategy_id: impl Into<String>,
        user_id: impl Into<String>,
        symbol: impl Into<String>,
        action: OrderAction,
        quantity: u32,
    ) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            user_id: user_id.into(),
            symbol: symbol.into(),
            action,
            side: action.side(),
            quantity,
            limit_price: None,
            client_order_id: Uuid::new_v4().to_string(),
        }
    }
}

/// 券商下单结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub broker_order_id: String,
    pub status: OrderStatus,
    pub fill_price: Option<f64>,
    pub error: Option<String>,
}

impl OrderResult {
    pub fn filled(broker_order_id: impl Into<String>, fill_price: f64) -> Self {
        Self {
            broker_order_id: broker_order_id.into(),
            status: OrderStatus::Filled,
            fill_price: Some(fill_price),
            error: None,
        }
    }
}

/// 券商持仓快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub quantity: i64,
    pub average_price: Option<f64>,
}

/// 券商长期持股（区别于当日持仓）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerHolding {
    pub symbol: String,
    pub quantity: i64,
    pub average_price: Option<f64>,
}

/// 券商账户信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerProfile {
    pub client_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
}
