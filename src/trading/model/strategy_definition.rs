use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use super::enums::StrategyStatus;
use super::keys::StrategyKey;

/// 持久化的策略定义（由外部定义存储提供，运行时只读）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDefinition {
    pub strategy_id: String,
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub symbol: String,
    /// 场所时区下的买入时刻
    pub buy_time: NaiveTime,
    /// 场所时区下的卖出时刻
    pub sell_time: NaiveTime,
    pub stop_loss: f64,
    pub quantity: u32,
    /// 券商标识，如 "dhan"、"paper"
    pub broker: String,
    #[serde(default = "default_definition_status")]
    pub status: StrategyStatus,
}

fn default_definition_status() -> StrategyStatus {
    StrategyStatus::Created
}

impl StrategyDefinition {
    pub fn key(&self) -> StrategyKey {
        StrategyKey::new(self.user_id.clone(), self.strategy_id.clone())
    }

    /// 校验定义自身的不变量（交易时段校验由调度器负责）
    pub fn validate(&self) -> Result<(), String> {
        if self.strategy_id.trim().is_empty() {
            return Err("strategy_id 不能为空".to_string());
        }
        if self.user_id.trim().is_empty() {
            return Err("user_id 不能为空".to_string());
        }
        if self.symbol.trim().is_empty() {
            return Err("symbol 不能为空".to_string());
        }
        if self.buy_time >= self.sell_time {
            return Err(format!(
                "买入时间必须早于卖出时间: buy_time={}, sell_time={}",
                self.buy_time, self.sell_time
            ));
        }
        if !(self.stop_loss > 0.0) || !self.stop_loss.is_finite() {
            return Err(format!("止损价必须大于0: {}", self.stop_loss));
        }
        if self.quantity == 0 {
            return Err("数量必须大于0".to_string());
        }
        if self.broker.trim().is_empty() {
            return Err("broker 不能为空".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> StrategyDefinition {
        StrategyDefinition {
            strategy_id: "s1".to_string(),
            user_id: "u1".to_string(),
            name: None,
            symbol: "RELIANCE".to_string(),
            buy_time: NaiveTime::from_hms_opt(9, 20, 0).unwrap(),
            sell_time: NaiveTime::from_hms_opt(15, 10, 0).unwrap(),
            stop_loss: 2500.0,
            quantity: 10,
            broker: "paper".to_string(),
            status: StrategyStatus::Created,
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(definition().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_window() {
        let mut def = definition();
        def.sell_time = def.buy_time;
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_positive_values() {
        let mut def = definition();
        def.stop_loss = 0.0;
        assert!(def.validate().is_err());

        let mut def = definition();
        def.stop_loss = f64::NAN;
        assert!(def.validate().is_err());

        let mut def = definition();
        def.quantity = 0;
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_deserialize_from_json() {
        let json = r#"{
            "strategy_id": "s9",
            "user_id": "u9",
            "symbol": "SBIN",
            "buy_time": "09:30:00",
            "sell_time": "15:00:00",
            "stop_loss": 590.5,
            "quantity": 5,
            "broker": "dhan"
        }"#;
        let def: StrategyDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.status, StrategyStatus::Created);
        assert_eq!(def.buy_time, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
    }
}
