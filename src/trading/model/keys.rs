use std::fmt;

use serde::{Deserialize, Serialize};

use super::enums::OrderAction;

/// 运行时状态索引集合（Redis 实现使用）
pub const RUNTIME_INDEX_KEY: &str = "runtime:strategies";

/// 策略唯一标识：(user_id, strategy_id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrategyKey {
    pub user_id: String,
    pub strategy_id: String,
}

impl StrategyKey {
    pub fn new(user_id: impl Into<String>, strategy_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            strategy_id: strategy_id.into(),
        }
    }

    /// 运行时状态存储键
    pub fn state_key(&self) -> String {
        runtime_state_key(&self.user_id, &self.strategy_id)
    }

    /// 从存储键反解析
    pub fn parse_state_key(key: &str) -> Option<Self> {
        let mut parts = key.splitn(4, ':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some("user"), Some(user_id), Some("strategy"), Some(strategy_id))
                if !user_id.is_empty() && !strategy_id.is_empty() =>
            {
                Some(Self::new(user_id, strategy_id))
            }
            _ => None,
        }
    }
}

impl fmt::Display for StrategyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.strategy_id)
    }
}

pub fn runtime_state_key(user_id: &str, strategy_id: &str) -> String {
    format!("user:{}:strategy:{}", user_id, strategy_id)
}

pub fn order_lock_key(strategy_id: &str, action: OrderAction) -> String {
    format!("lock:order:{}:{}", strategy_id, action.as_str())
}

pub fn event_channel_key(user_id: &str) -> String {
    format!("events:{}", user_id)
}

pub fn audit_key(strategy_id: &str) -> String {
    format!("audit:orders:{}", strategy_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_namespace() {
        let key = StrategyKey::new("u1", "s1");
        assert_eq!(key.state_key(), "user:u1:strategy:s1");
        assert_eq!(order_lock_key("s1", OrderAction::SlSell), "lock:order:s1:SL_SELL");
        assert_eq!(event_channel_key("u1"), "events:u1");
    }

    #[test]
    fn test_parse_state_key() {
        let key = StrategyKey::parse_state_key("user:u1:strategy:abc-123").unwrap();
        assert_eq!(key, StrategyKey::new("u1", "abc-123"));
        assert!(StrategyKey::parse_state_key("lock:order:s1:BUY").is_none());
        assert!(StrategyKey::parse_state_key("user::strategy:s1").is_none());
    }
}
