use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::EventType;

/// 推送给订阅者的运行时事件，sequence_id 按用户单调递增
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeEvent {
    pub event_type: EventType,
    pub user_id: String,
    pub strategy_id: Option<String>,
    pub payload: serde_json::Value,
    pub sequence_id: u64,
    pub occurred_at: DateTime<Utc>,
}
