use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::enums::{OrderAction, PositionState, StrategyStatus};
use super::keys::StrategyKey;
use super::strategy_definition::StrategyDefinition;

/// 非法状态迁移
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateTransitionError {
    #[error("非法的策略状态迁移: {from} -> {to}")]
    Status {
        from: StrategyStatus,
        to: StrategyStatus,
    },

    #[error("非法的持仓状态迁移: {from} -> {to}")]
    Position {
        from: PositionState,
        to: PositionState,
    },
}

/// 策略运行时状态，每个 (user_id, strategy_id) 在运行期间唯一一份
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRuntimeState {
    pub strategy_id: String,
    pub user_id: String,
    pub symbol: String,

    // 运行期间不可变的配置
    pub buy_time: NaiveTime,
    pub sell_time: NaiveTime,
    pub stop_loss: f64,
    pub quantity: u32,
    pub broker: String,

    pub status: StrategyStatus,
    pub position: PositionState,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    /// 已实现盈亏 = (exit - entry) * quantity
    pub realized_pnl: Option<f64>,
    pub last_action: Option<OrderAction>,
    pub sl_triggered: bool,
    /// 重试耗尽后置位，需要人工介入
    pub needs_manual_intervention: bool,
    pub last_error: Option<String>,
    pub stop_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub entered_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl StrategyRuntimeState {
    /// 从持久化定义物化运行时状态（初始为 CREATED / NONE）
    pub fn from_definition(definition: &StrategyDefinition, now: DateTime<Utc>) -> Self {
        Self {
            strategy_id: definition.strategy_id.clone(),
            user_id: definition.user_id.clone(),
            symbol: definition.symbol.clone(),
            buy_time: definition.buy_time,
            sell_time: definition.sell_time,
            stop_loss: definition.stop_loss,
            quantity: definition.quantity,
            broker: definition.broker.clone(),
            status: StrategyStatus::Created,
            position: PositionState::None,
            entry_price: None,
            exit_price: None,
            realized_pnl: None,
            last_action: None,
            sl_triggered: false,
            needs_manual_intervention: false,
            last_error: None,
            stop_reason: None,
            created_at: now,
            started_at: None,
            entered_at: None,
            exited_at: None,
            updated_at: now,
        }
    }

    pub fn key(&self) -> StrategyKey {
        StrategyKey::new(self.user_id.clone(), self.strategy_id.clone())
    }

    pub fn is_running(&self) -> bool {
        self.status == StrategyStatus::Running
    }

    /// 是否持有未平仓头寸
    pub fn has_open_position(&self) -> bool {
        self.position == PositionState::Bought
    }

    /// 止损监控关注的策略：运行中、已买入、未触发过止损
    pub fn is_stop_loss_candidate(&self, symbol: &str) -> bool {
        self.is_running() && self.has_open_position() && !self.sl_triggered && self.symbol == symbol
    }
}

/// 运行时状态的部分更新，只合并显式提供的字段
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub status: Option<StrategyStatus>,
    pub position: Option<PositionState>,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub last_action: Option<OrderAction>,
    pub sl_triggered: Option<bool>,
    pub needs_manual_intervention: Option<bool>,
    /// Some(None) 表示清空
    pub last_error: Option<Option<String>>,
    pub stop_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub entered_at: Option<DateTime<Utc>>,
    pub exited_at: Option<DateTime<Utc>>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: StrategyStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn position(mut self, position: PositionState) -> Self {
        self.position = Some(position);
        self
    }

    pub fn entry_price(mut self, price: f64) -> Self {
        self.entry_price = Some(price);
        self
    }

    pub fn exit_price(mut self, price: f64) -> Self {
        self.exit_price = Some(price);
        self
    }

    pub fn realized_pnl(mut self, pnl: f64) -> Self {
        self.realized_pnl = Some(pnl);
        self
    }

    pub fn last_action(mut self, action: OrderAction) -> Self {
        self.last_action = Some(action);
        self
    }

    pub fn sl_triggered(mut self, value: bool) -> Self {
        self.sl_triggered = Some(value);
        self
    }

    pub fn needs_manual_intervention(mut self, value: bool) -> Self {
        self.needs_manual_intervention = Some(value);
        self
    }

    pub fn last_error(mut self, message: impl Into<String>) -> Self {
        self.last_error = Some(Some(message.into()));
        self
    }

    pub fn clear_last_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    pub fn stop_reason(mut self, reason: impl Into<String>) -> Self {
        self.stop_reason = Some(reason.into());
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn entered_at(mut self, at: DateTime<Utc>) -> Self {
        self.entered_at = Some(at);
        self
    }

    pub fn exited_at(mut self, at: DateTime<Utc>) -> Self {
        self.exited_at = Some(at);
        self
    }

    /// 合并到目标状态。先整体校验迁移，校验失败时目标状态保持不变
    pub fn apply(
        &self,
        state: &mut StrategyRuntimeState,
        now: DateTime<Utc>,
    ) -> Result<(), StateTransitionError> {
        if let Some(next) = self.status {
            if !state.status.can_transition_to(next) {
                return Err(StateTransitionError::Status {
                    from: state.status,
                    to: next,
                });
            }
        }
        if let Some(next) = self.position {
            if !state.position.can_transition_to(next) {
                return Err(StateTransitionError::Position {
                    from: state.position,
                    to: next,
                });
            }
        }

        if let Some(status) = self.status {
            state.status = status;
        }
        if let Some(position) = self.position {
            state.position = position;
        }
        if let Some(price) = self.entry_price {
            state.entry_price = Some(price);
        }
        if let Some(price) = self.exit_price {
            state.exit_price = Some(price);
        }
        if let Some(pnl) = self.realized_pnl {
            state.realized_pnl = Some(pnl);
        }
        if let Some(action) = self.last_action {
            state.last_action = Some(action);
        }
        if let Some(flag) = self.sl_triggered {
            state.sl_triggered = flag;
        }
        if let Some(flag) = self.needs_manual_intervention {
            state.needs_manual_intervention = flag;
        }
        if let Some(error) = &self.last_error {
            state.last_error = error.clone();
        }
        if let Some(reason) = &self.stop_reason {
            state.stop_reason = Some(reason.clone());
        }
        if let Some(at) = self.started_at {
            state.started_at = Some(at);
        }
        if let Some(at) = self.entered_at {
            state.entered_at = Some(at);
        }
        if let Some(at) = self.exited_at {
            state.exited_at = Some(at);
        }
        state.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn state() -> StrategyRuntimeState {
        let def = StrategyDefinition {
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
        };
        StrategyRuntimeState::from_definition(&def, Utc::now())
    }

    #[test]
    fn test_apply_merges_only_supplied_fields() {
        let mut s = state();
        let update = StateUpdate::new()
            .status(StrategyStatus::Running)
            .last_error("boom");
        update.apply(&mut s, Utc::now()).unwrap();
        assert_eq!(s.status, StrategyStatus::Running);
        assert_eq!(s.position, PositionState::None);
        assert_eq!(s.last_error.as_deref(), Some("boom"));

        StateUpdate::new().clear_last_error().apply(&mut s, Utc::now()).unwrap();
        assert!(s.last_error.is_none());
    }

    #[test]
    fn test_apply_rejects_illegal_transition_without_side_effects() {
        let mut s = state();
        let before = s.clone();
        let err = StateUpdate::new()
            .position(PositionState::Sold)
            .exit_price(10.0)
            .apply(&mut s, Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            StateTransitionError::Position {
                from: PositionState::None,
                to: PositionState::Sold
            }
        );
        assert_eq!(s, before);
    }

    fn any_position() -> impl Strategy<Value = PositionState> {
        prop_oneof![
            Just(PositionState::None),
            Just(PositionState::Bought),
            Just(PositionState::Sold),
            Just(PositionState::SlHit),
        ]
    }

    proptest! {
        /// 任意写入序列下观察到的持仓路径都是 NONE→BOUGHT→{SOLD|SL_HIT} 的前缀
        #[test]
        fn prop_position_path_is_always_valid(seq in proptest::collection::vec(any_position(), 0..20)) {
            let mut s = state();
            let mut observed = vec![s.position];
            for next in seq {
                if StateUpdate::new().position(next).apply(&mut s, Utc::now()).is_ok()
                    && observed.last() != Some(&s.position)
                {
                    observed.push(s.position);
                }
            }
            let valid_sold = [PositionState::None, PositionState::Bought, PositionState::Sold];
            let valid_sl = [PositionState::None, PositionState::Bought, PositionState::SlHit];
            prop_assert!(
                valid_sold.starts_with(&observed) || valid_sl.starts_with(&observed),
                "observed path {:?}", observed
            );
        }
    }
}
