use std::fmt;

use serde::{Deserialize, Serialize};

/// 策略运行状态
///
/// 合法迁移：CREATED→RUNNING→{STOPPED, COMPLETED, ERROR}，唯一的回退边是 STOPPED→RUNNING（重启）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyStatus {
    /// 已创建，尚未启动
    Created,
    /// 运行中
    Running,
    /// 已停止
    Stopped,
    /// 已完成（本轮已平仓）
    Completed,
    /// 错误状态
    Error,
}

impl StrategyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStatus::Created => "CREATED",
            StrategyStatus::Running => "RUNNING",
            StrategyStatus::Stopped => "STOPPED",
            StrategyStatus::Completed => "COMPLETED",
            StrategyStatus::Error => "ERROR",
        }
    }

    /// 检查状态迁移是否合法（相同状态视为幂等写入）
    pub fn can_transition_to(&self, next: StrategyStatus) -> bool {
        use StrategyStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Stopped)
                | (Running, Completed)
                | (Running, Error)
                | (Stopped, Running)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StrategyStatus::Completed | StrategyStatus::Error)
    }
}

impl fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 持仓状态
///
/// 只允许 NONE→BOUGHT→{SOLD, SL_HIT}，SOLD 与 SL_HIT 为本轮终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    None,
    Bought,
    Sold,
    SlHit,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::None => "NONE",
            PositionState::Bought => "BOUGHT",
            PositionState::Sold => "SOLD",
            PositionState::SlHit => "SL_HIT",
        }
    }

    pub fn can_transition_to(&self, next: PositionState) -> bool {
        use PositionState::*;
        if *self == next {
            return true;
        }
        matches!((self, next), (None, Bought) | (Bought, Sold) | (Bought, SlHit))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionState::Sold | PositionState::SlHit)
    }
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 下单动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderAction {
    Buy,
    Sell,
    SlSell,
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Buy => "BUY",
            OrderAction::Sell => "SELL",
            OrderAction::SlSell => "SL_SELL",
        }
    }

    /// 券商侧买卖方向
    pub fn side(&self) -> OrderSide {
        match self {
            OrderAction::Buy => OrderSide::Buy,
            OrderAction::Sell | OrderAction::SlSell => OrderSide::Sell,
        }
    }

    /// 执行该动作时要求的持仓状态
    pub fn required_position(&self) -> PositionState {
        match self {
            OrderAction::Buy => PositionState::None,
            OrderAction::Sell | OrderAction::SlSell => PositionState::Bought,
        }
    }

    /// 成交后的持仓状态
    pub fn resulting_position(&self) -> PositionState {
        match self {
            OrderAction::Buy => PositionState::Bought,
            OrderAction::Sell => PositionState::Sold,
            OrderAction::SlSell => PositionState::SlHit,
        }
    }

    pub fn is_exit(&self) -> bool {
        !matches!(self, OrderAction::Buy)
    }
}

impl fmt::Display for OrderAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// 券商订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Filled,
    Pending,
    Rejected,
    Cancelled,
}

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    OrderExecuted,
    StopLossTriggered,
    StrategyStarted,
    StrategyStopped,
    StrategyCompleted,
    StrategyError,
    PriceUpdate,
    FeedRestored,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OrderExecuted => "ORDER_EXECUTED",
            EventType::StopLossTriggered => "STOP_LOSS_TRIGGERED",
            EventType::StrategyStarted => "STRATEGY_STARTED",
            EventType::StrategyStopped => "STRATEGY_STOPPED",
            EventType::StrategyCompleted => "STRATEGY_COMPLETED",
            EventType::StrategyError => "STRATEGY_ERROR",
            EventType::PriceUpdate => "PRICE_UPDATE",
            EventType::FeedRestored => "FEED_RESTORED",
        }
    }
}
