//! 买入/卖出定时触发
//!
//! 每个运行中的策略注册两个触发器，按场所时区在每个交易日的固定时刻触发。
//! 触发时只把动作交给执行引擎，不直接下单。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::app_config::settings::RuntimeSettings;
use crate::error::{ErrorKind, ExecutionError, SchedulerError};
use crate::time_util::{next_trading_occurrence, venue_time_of_day, Clock, TradingWindow};
use crate::trading::model::{OrderAction, StrategyKey, StrategyRuntimeState};

use super::execution_engine::{ExecutionEngine, ExecutionOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    Buy,
    Sell,
}

impl TriggerKind {
    pub fn action(&self) -> OrderAction {
        match self {
            TriggerKind::Buy => OrderAction::Buy,
            TriggerKind::Sell => OrderAction::Sell,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Buy => "buy",
            TriggerKind::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub venue_offset: FixedOffset,
    pub trading_window: TradingWindow,
    /// 唤醒时间晚于目标超过该值则视为错过
    pub misfire_grace: Duration,
}

impl SchedulerSettings {
    pub fn from_runtime(settings: &RuntimeSettings) -> Self {
        Self {
            venue_offset: settings.venue_offset,
            trading_window: settings.trading_window,
            misfire_grace: settings.misfire_grace,
        }
    }
}

struct TriggerHandle {
    id: u64,
    // 丢弃即取消
    _cancel: oneshot::Sender<()>,
}

pub struct StrategyScheduler {
    engine: Arc<ExecutionEngine>,
    settings: SchedulerSettings,
    clock: Arc<dyn Clock>,
    triggers: Arc<DashMap<(StrategyKey, TriggerKind), TriggerHandle>>,
    next_id: AtomicU64,
}

impl StrategyScheduler {
    pub fn new(
        engine: Arc<ExecutionEngine>,
        settings: SchedulerSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            engine,
            settings,
            clock,
            triggers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 触发时刻必须落在交易时段内
    pub fn check_window(&self, time: NaiveTime) -> Result<(), SchedulerError> {
        let window = self.settings.trading_window;
        if window.contains(time) {
            Ok(())
        } else {
            Err(SchedulerError::OutsideTradingWindow {
                time,
                start: window.start,
                end: window.end,
            })
        }
    }

    /// 注册买入与卖出触发器；已存在的同名触发器被替换
    pub fn register(&self, state: &StrategyRuntimeState) -> Result<(), SchedulerError> {
        self.check_window(state.buy_time)?;
        self.check_window(state.sell_time)?;
        let key = state.key();
        self.register_trigger(&key, TriggerKind::Buy, state.buy_time)?;
        self.register_trigger(&key, TriggerKind::Sell, state.sell_time)?;
        Ok(())
    }

    fn register_trigger(
        &self,
        key: &StrategyKey,
        kind: TriggerKind,
        time: NaiveTime,
    ) -> Result<(), SchedulerError> {
        let first = next_trading_occurrence(self.clock.now(), time, self.settings.venue_offset)
            .ok_or(SchedulerError::NoUpcomingOccurrence(time))?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let previous = self.triggers.insert(
            (key.clone(), kind),
            TriggerHandle {
                id,
                _cancel: cancel_tx,
            },
        );
        if previous.is_some() {
            debug!("替换已注册的触发器 {} {}", key, kind.as_str());
        }

        let task = TriggerTask {
            id,
            key: key.clone(),
            kind,
            time,
            engine: self.engine.clone(),
            settings: self.settings.clone(),
            clock: self.clock.clone(),
            triggers: self.triggers.clone(),
        };
        tokio::spawn(task.run(first, cancel_rx));
        info!(
            user_id = %key.user_id,
            strategy_id = %key.strategy_id,
            "注册{}触发器 time={} first={}",
            kind.as_str(),
            time,
            first
        );
        Ok(())
    }

    /// 取消策略的两个触发器，返回实际取消的数量
    pub fn cancel(&self, key: &StrategyKey) -> usize {
        let mut cancelled = 0;
        for kind in [TriggerKind::Buy, TriggerKind::Sell] {
            if self.triggers.remove(&(key.clone(), kind)).is_some() {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!("取消触发器 {} count={}", key, cancelled);
        }
        cancelled
    }

    pub fn cancel_all(&self) {
        let count = self.triggers.len();
        self.triggers.clear();
        info!("已取消全部触发器: {}", count);
    }

    pub fn is_registered(&self, key: &StrategyKey, kind: TriggerKind) -> bool {
        self.triggers.contains_key(&(key.clone(), kind))
    }

    pub fn registered_count(&self) -> usize {
        self.triggers.len()
    }
}

struct TriggerTask {
    id: u64,
    key: StrategyKey,
    kind: TriggerKind,
    time: NaiveTime,
    engine: Arc<ExecutionEngine>,
    settings: SchedulerSettings,
    clock: Arc<dyn Clock>,
    triggers: Arc<DashMap<(StrategyKey, TriggerKind), TriggerHandle>>,
}

impl TriggerTask {
    async fn run(self, first: DateTime<Utc>, mut cancel: oneshot::Receiver<()>) {
        let mut target = first;
        loop {
            let wait = (target - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
            // 只有等待阶段可以被取消，已提交的执行会跑完
            tokio::select! {
                _ = &mut cancel => {
                    debug!("触发器已取消 {} {}", self.key, self.kind.as_str());
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            let late = self.clock.now() - target;
            let grace = chrono::Duration::from_std(self.settings.misfire_grace)
                .unwrap_or_else(|_| chrono::Duration::zero());
            if late > grace {
                warn!(
                    user_id = %self.key.user_id,
                    strategy_id = %self.key.strategy_id,
                    "{}触发器错过执行时间 target={} late={}s",
                    self.kind.as_str(),
                    target,
                    late.num_seconds()
                );
            } else if !self
                .settings
                .trading_window
                .contains(venue_time_of_day(target, self.settings.venue_offset))
            {
                let window = self.settings.trading_window;
                let message = SchedulerError::OutsideTradingWindow {
                    time: self.time,
                    start: window.start,
                    end: window.end,
                }
                .to_string();
                self.engine
                    .fail(&self.key, ErrorKind::Validation, &message)
                    .await;
                self.finish();
                return;
            } else {
                self.fire().await;
            }

            target = match next_trading_occurrence(target, self.time, self.settings.venue_offset) {
                Some(next) => next,
                None => {
                    error!("找不到下一次触发时间 {} {}", self.key, self.kind.as_str());
                    self.finish();
                    return;
                }
            };
        }
    }

    async fn fire(&self) {
        let action = self.kind.action();
        info!(
            user_id = %self.key.user_id,
            strategy_id = %self.key.strategy_id,
            action = %action,
            "定时触发"
        );
        match self.engine.execute(&self.key, action).await {
            Ok(ExecutionOutcome::Executed { fill_price, .. }) => {
                info!("定时{}成交 {} fill_price={}", action, self.key, fill_price);
            }
            Ok(ExecutionOutcome::NoOp { reason }) => {
                info!("定时{}无需执行 {}: {}", action, self.key, reason);
            }
            Err(ExecutionError::Validation(reason)) => {
                info!("定时{}跳过 {}: {}", action, self.key, reason);
            }
            Err(e @ ExecutionError::DuplicateOrder { .. }) => {
                warn!("定时{}与其他执行冲突 {}: {}", action, self.key, e);
            }
            // 引擎已置 ERROR 并发布事件
            Err(e) => error!("定时{}执行失败 {}: {}", action, self.key, e),
        }
    }

    /// 任务自然结束时移除自己的登记（不影响之后重新注册的同名触发器）
    fn finish(&self) {
        self.triggers
            .remove_if(&(self.key.clone(), self.kind), |_, handle| handle.id == self.id);
    }
}
