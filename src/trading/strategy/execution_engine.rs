//! 下单执行引擎
//!
//! 调度器与止损监控的唯一出口，也是运行时状态的唯一写入方。
//! 流程：校验前置条件 → 获取下单锁 → 锁内复核 → 调用券商（带重试）→ 提交状态 → 释放锁 → 发布事件 → 审计。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{mpsc, OwnedRwLockWriteGuard, RwLock, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::app_config::settings::{RetrySettings, RuntimeSettings};
use crate::error::{BrokerError, ErrorKind, ExecutionError, StoreError};
use crate::trading::broker::{BrokerAdapter, BrokerSessions};
use crate::trading::cache::{LockToken, OrderLock, ReleaseOutcome, RuntimeStateStore};
use crate::trading::market::FeedHealthListener;
use crate::trading::model::keys::order_lock_key;
use crate::trading::model::{
    EventType, OrderAction, OrderIntent, OrderResult, OrderStatus, PositionState,
    StateTransitionError, StateUpdate, StrategyDefinition, StrategyKey, StrategyRuntimeState,
    StrategyStatus,
};
use crate::trading::services::audit_service::{AuditRecord, AuditSink};
use crate::trading::services::event_bus::EventBus;

use super::retry::retry_broker_call;

const FEED_ERROR_PREFIX: &str = "FeedDisconnected";

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub lock_ttl: Duration,
    pub broker_call_timeout: Duration,
    /// 挂单等待成交的上限，不超过锁 TTL 的一半
    pub fill_timeout: Duration,
    pub fill_poll: Duration,
    pub retry: RetrySettings,
    pub workers: usize,
}

impl ExecutionSettings {
    pub fn from_runtime(settings: &RuntimeSettings) -> Self {
        Self {
            lock_ttl: settings.order_lock_ttl,
            broker_call_timeout: settings.broker_call_timeout,
            fill_timeout: settings.order_fill_timeout.min(settings.order_lock_ttl / 2),
            fill_poll: settings.order_fill_poll,
            retry: settings.retry.clone(),
            workers: settings.execution_workers,
        }
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            broker_call_timeout: Duration::from_secs(5),
            fill_timeout: Duration::from_secs(10),
            fill_poll: Duration::from_millis(500),
            retry: RetrySettings::default(),
            workers: 16,
        }
    }
}

/// 引擎通知策略管理器的生命周期变化
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleSignal {
    /// 平仓成交，本轮结束
    Completed(StrategyKey),
    /// 进入 ERROR
    Failed { key: StrategyKey, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Executed {
        action: OrderAction,
        broker_order_id: String,
        fill_price: f64,
        position: PositionState,
        realized_pnl: Option<f64>,
        attempts: usize,
    },
    /// 锁内复核发现前置条件已不成立
    NoOp { reason: String },
}

/// 执行前置条件：运行中，且持仓状态与动作匹配
pub fn check_preconditions(
    state: &StrategyRuntimeState,
    action: OrderAction,
) -> Result<(), String> {
    if state.status != StrategyStatus::Running {
        return Err(format!("策略未运行: status={}", state.status));
    }
    let required = action.required_position();
    if state.position != required {
        return Err(format!(
            "{} 要求持仓 {}，当前 {}",
            action, required, state.position
        ));
    }
    if action == OrderAction::SlSell && state.sl_triggered {
        return Err("止损已触发".to_string());
    }
    Ok(())
}

/// 同一策略需要互斥的锁。卖出与止损卖出共用两把锁，按固定顺序获取
fn lock_actions(action: OrderAction) -> &'static [OrderAction] {
    if action.is_exit() {
        &[OrderAction::Sell, OrderAction::SlSell]
    } else {
        &[OrderAction::Buy]
    }
}

struct Escalation {
    error: ExecutionError,
    manual: bool,
}

pub struct ExecutionEngine {
    store: Arc<dyn RuntimeStateStore>,
    locks: Arc<dyn OrderLock>,
    sessions: Arc<BrokerSessions>,
    event_bus: Arc<EventBus>,
    audit: Arc<dyn AuditSink>,
    settings: ExecutionSettings,
    workers: Semaphore,
    // 每个策略一把读写锁：执行持读锁，停止时取写锁等待在途执行结束
    gates: DashMap<StrategyKey, Arc<RwLock<()>>>,
    lifecycle_tx: mpsc::UnboundedSender<LifecycleSignal>,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn RuntimeStateStore>,
        locks: Arc<dyn OrderLock>,
        sessions: Arc<BrokerSessions>,
        event_bus: Arc<EventBus>,
        audit: Arc<dyn AuditSink>,
        settings: ExecutionSettings,
        lifecycle_tx: mpsc::UnboundedSender<LifecycleSignal>,
    ) -> Self {
        let workers = Semaphore::new(settings.workers.max(1));
        Self {
            store,
            locks,
            sessions,
            event_bus,
            audit,
            settings,
            workers,
            gates: DashMap::new(),
            lifecycle_tx,
        }
    }

    pub fn store(&self) -> &Arc<dyn RuntimeStateStore> {
        &self.store
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    fn gate(&self, key: &StrategyKey) -> Arc<RwLock<()>> {
        self.gates
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// 等待该策略所有在途执行结束；持有返回值期间新的执行会排队等待
    pub async fn drain(&self, key: &StrategyKey) -> OwnedRwLockWriteGuard<()> {
        self.gate(key).write_owned().await
    }

    /// 执行一次下单动作
    pub async fn execute(
        &self,
        key: &StrategyKey,
        action: OrderAction,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let gate = self.gate(key);
        let _in_flight = gate.read().await;

        let snapshot = self.store.get(key).await?;
        let symbol = snapshot
            .as_ref()
            .map(|s| s.symbol.clone())
            .unwrap_or_default();
        let record = AuditRecord::begin(key, &symbol, action);

        let precheck = match &snapshot {
            Some(state) => check_preconditions(state, action),
            None => Err("运行时状态不存在".to_string()),
        };
        if let Err(reason) = precheck {
            debug!(
                user_id = %key.user_id,
                strategy_id = %key.strategy_id,
                action = %action,
                "前置条件不满足: {}",
                reason
            );
            let err = ExecutionError::Validation(reason);
            self.write_audit(record.failed(err.kind(), &err.to_string()))
                .await;
            return Err(err);
        }

        let _permit = match self.workers.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                let err = ExecutionError::Validation("执行引擎已关闭".to_string());
                self.write_audit(record.failed(err.kind(), &err.to_string()))
                    .await;
                return Err(err);
            }
        };

        let held = match self.acquire_locks(&key.strategy_id, action).await {
            Ok(held) => held,
            Err(err) => {
                warn!(
                    user_id = %key.user_id,
                    strategy_id = %key.strategy_id,
                    action = %action,
                    "下单锁获取失败: {}",
                    err
                );
                self.write_audit(record.failed(err.kind(), &err.to_string()))
                    .await;
                return Err(err);
            }
        };

        let (result, attempts) = self.execute_locked(key, action).await;
        self.release_locks(held).await;

        let mut record = record;
        record.attempts = attempts;
        match &result {
            Ok(ExecutionOutcome::Executed {
                broker_order_id,
                fill_price,
                ..
            }) => {
                self.publish_success(key, action, &result);
                self.write_audit(record.filled(broker_order_id, *fill_price))
                    .await;
            }
            Ok(ExecutionOutcome::NoOp { reason }) => {
                info!(
                    user_id = %key.user_id,
                    strategy_id = %key.strategy_id,
                    action = %action,
                    "锁内复核未通过，跳过: {}",
                    reason
                );
                self.write_audit(record.no_op(reason)).await;
            }
            Err(err) => {
                self.write_audit(record.failed(err.kind(), &err.to_string()))
                    .await;
            }
        }
        result
    }

    async fn acquire_locks(
        &self,
        strategy_id: &str,
        action: OrderAction,
    ) -> Result<Vec<(String, LockToken)>, ExecutionError> {
        let mut held = Vec::new();
        for lock_action in lock_actions(action) {
            let lock_key = order_lock_key(strategy_id, *lock_action);
            match self
                .locks
                .try_acquire(&lock_key, self.settings.lock_ttl)
                .await
            {
                Ok(Some(token)) => held.push((lock_key, token)),
                Ok(None) => {
                    self.release_locks(held).await;
                    return Err(ExecutionError::DuplicateOrder { lock_key });
                }
                Err(e) => {
                    self.release_locks(held).await;
                    return Err(ExecutionError::Store(format!("获取下单锁失败: {}", e)));
                }
            }
        }
        Ok(held)
    }

    async fn release_locks(&self, held: Vec<(String, LockToken)>) {
        for (lock_key, token) in held.into_iter().rev() {
            match self.locks.release(&lock_key, &token).await {
                Ok(ReleaseOutcome::Released) => {}
                Ok(ReleaseOutcome::AlreadyExpired) => {
                    warn!("下单锁释放时已过期: {}", lock_key);
                }
                Err(e) => error!("下单锁释放失败 {}: {}", lock_key, e),
            }
        }
    }

    /// 持锁期间的执行，返回结果与券商调用次数
    async fn execute_locked(
        &self,
        key: &StrategyKey,
        action: OrderAction,
    ) -> (Result<ExecutionOutcome, ExecutionError>, usize) {
        let state = match self.store.get(key).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                return (
                    Ok(ExecutionOutcome::NoOp {
                        reason: "运行时状态已删除".to_string(),
                    }),
                    0,
                )
            }
            Err(e) => return (Err(e.into()), 0),
        };
        if let Err(reason) = check_preconditions(&state, action) {
            return (Ok(ExecutionOutcome::NoOp { reason }), 0);
        }

        if action == OrderAction::SlSell {
            if let Err(e) = self
                .store
                .update(key, &StateUpdate::new().sl_triggered(true))
                .await
            {
                return (Err(e.into()), 0);
            }
        }

        let adapter = match self.sessions.get_or_connect(&key.user_id, &state.broker).await {
            Ok(adapter) => adapter,
            Err(e) => {
                let escalation = Escalation {
                    manual: state.has_open_position(),
                    error: ExecutionError::Broker(e),
                };
                return (Err(self.escalate(key, action, escalation).await), 0);
            }
        };

        let intent = OrderIntent::market(
            key.strategy_id.clone(),
            key.user_id.clone(),
            state.symbol.clone(),
            action,
            state.quantity,
        );
        info!(
            user_id = %key.user_id,
            strategy_id = %key.strategy_id,
            action = %action,
            symbol = %state.symbol,
            "提交订单 quantity={} client_order_id={}",
            intent.quantity,
            intent.client_order_id
        );

        let outcome = retry_broker_call(
            &self.settings.retry,
            self.settings.broker_call_timeout,
            || adapter.place_order(&intent),
        )
        .await;
        let attempts = outcome.attempts;

        let order = match outcome.result {
            Ok(order) => order,
            Err(e) => {
                let escalation = if e.is_retryable() {
                    Escalation {
                        error: ExecutionError::ExecutionFailure {
                            attempts,
                            last_error: e.to_string(),
                        },
                        manual: true,
                    }
                } else {
                    Escalation {
                        error: ExecutionError::Broker(e),
                        manual: state.has_open_position(),
                    }
                };
                return (Err(self.escalate(key, action, escalation).await), attempts);
            }
        };

        // 挂单在持锁期间等待终态，仍未成交则交人工核对
        let order = if order.status == OrderStatus::Pending {
            match self
                .await_fill(adapter.as_ref(), key, &order.broker_order_id)
                .await
            {
                Ok(settled) => settled,
                Err(err) => {
                    let escalation = Escalation { error: err, manual: true };
                    return (Err(self.escalate(key, action, escalation).await), attempts);
                }
            }
        } else {
            order
        };

        if order.status != OrderStatus::Filled {
            let reason = order
                .error
                .clone()
                .unwrap_or_else(|| format!("订单状态 {:?}", order.status));
            let escalation = Escalation {
                error: ExecutionError::Broker(BrokerError::Rejected(reason)),
                manual: state.has_open_position(),
            };
            return (Err(self.escalate(key, action, escalation).await), attempts);
        }

        let fill_price = match order.fill_price {
            Some(price) => price,
            None => match self.fallback_fill_price(adapter.as_ref(), &state.symbol).await {
                Ok(price) => price,
                Err(e) => {
                    // 订单已提交但成交价未知，只能人工核对
                    let escalation = Escalation {
                        error: ExecutionError::Broker(e),
                        manual: true,
                    };
                    return (Err(self.escalate(key, action, escalation).await), attempts);
                }
            },
        };

        let result = self
            .commit_fill(key, &state, action, &order.broker_order_id, fill_price, attempts)
            .await;
        (result, attempts)
    }

    /// 轮询挂单直到成交、拒单或撤单；超时后尝试撤单并返回 FillTimeout
    async fn await_fill(
        &self,
        adapter: &dyn BrokerAdapter,
        key: &StrategyKey,
        broker_order_id: &str,
    ) -> Result<OrderResult, ExecutionError> {
        let waited = self.settings.fill_timeout;
        let deadline = Instant::now() + waited;
        info!(
            user_id = %key.user_id,
            strategy_id = %key.strategy_id,
            "订单挂单中，等待成交 order_id={}",
            broker_order_id
        );

        while Instant::now() < deadline {
            tokio::time::sleep(self.settings.fill_poll).await;
            let polled = tokio::time::timeout(
                self.settings.broker_call_timeout,
                adapter.get_order_status(broker_order_id),
            )
            .await;
            match polled {
                Ok(Ok(latest)) if latest.status != OrderStatus::Pending => return Ok(latest),
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.is_retryable() => {
                    warn!("查询订单状态失败 order_id={}: {}", broker_order_id, e);
                }
                Ok(Err(e)) => return Err(ExecutionError::Broker(e)),
                Err(_) => warn!("查询订单状态超时 order_id={}", broker_order_id),
            }
        }

        match adapter.cancel_order(broker_order_id).await {
            Ok(()) => warn!("挂单超时已撤单 order_id={}", broker_order_id),
            Err(e) => error!("挂单超时撤单失败 order_id={}: {}", broker_order_id, e),
        }
        Err(ExecutionError::FillTimeout {
            broker_order_id: broker_order_id.to_string(),
            waited,
        })
    }

    async fn fallback_fill_price(
        &self,
        adapter: &dyn BrokerAdapter,
        symbol: &str,
    ) -> Result<f64, BrokerError> {
        warn!("券商未返回成交价，使用最新价: {}", symbol);
        tokio::time::timeout(self.settings.broker_call_timeout, adapter.get_last_price(symbol))
            .await
            .map_err(|_| BrokerError::Timeout(self.settings.broker_call_timeout))?
    }

    async fn commit_fill(
        &self,
        key: &StrategyKey,
        state: &StrategyRuntimeState,
        action: OrderAction,
        broker_order_id: &str,
        fill_price: f64,
        attempts: usize,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let now = Utc::now();
        let position = action.resulting_position();
        let mut update = StateUpdate::new()
            .position(position)
            .last_action(action)
            .clear_last_error();

        let realized_pnl = if action.is_exit() {
            let entry = state.entry_price.unwrap_or(fill_price);
            let pnl = (fill_price - entry) * state.quantity as f64;
            update = update.exit_price(fill_price).realized_pnl(pnl).exited_at(now);
            Some(pnl)
        } else {
            update = update.entry_price(fill_price).entered_at(now);
            None
        };

        let with_status = if action.is_exit() {
            update.clone().status(StrategyStatus::Completed)
        } else {
            update.clone()
        };
        let committed = match self.store.update(key, &with_status).await {
            Ok(state) => state,
            // 在途期间策略被停止：成交结果照常写入，状态保持 STOPPED
            Err(StoreError::Transition(StateTransitionError::Status { .. })) => {
                self.store.update(key, &update).await?
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            user_id = %key.user_id,
            strategy_id = %key.strategy_id,
            action = %action,
            "订单成交 order_id={} fill_price={} position={} pnl={:?}",
            broker_order_id,
            fill_price,
            committed.position,
            realized_pnl
        );

        if committed.status == StrategyStatus::Completed {
            self.signal(LifecycleSignal::Completed(key.clone()));
        }

        Ok(ExecutionOutcome::Executed {
            action,
            broker_order_id: broker_order_id.to_string(),
            fill_price,
            position,
            realized_pnl,
            attempts,
        })
    }

    /// 不可恢复的失败：置 ERROR，必要时标记人工介入，发布错误事件
    async fn escalate(
        &self,
        key: &StrategyKey,
        action: OrderAction,
        escalation: Escalation,
    ) -> ExecutionError {
        let Escalation { error: err, manual } = escalation;
        let message = err.to_string();
        error!(
            user_id = %key.user_id,
            strategy_id = %key.strategy_id,
            action = %action,
            "下单失败 kind={} manual={}: {}",
            err.kind(),
            manual,
            message
        );

        let mut update = StateUpdate::new().last_error(message.clone());
        if manual {
            update = update.needs_manual_intervention(true);
        }
        self.transition_to_error(key, update).await;

        self.event_bus.publish(
            &key.user_id,
            EventType::StrategyError,
            Some(&key.strategy_id),
            json!({
                "kind": err.kind().as_str(),
                "action": action.as_str(),
                "message": message,
                "needs_manual_intervention": manual,
            }),
        );
        self.signal(LifecycleSignal::Failed {
            key: key.clone(),
            reason: message,
        });
        err
    }

    fn signal(&self, signal: LifecycleSignal) {
        if let Err(e) = self.lifecycle_tx.send(signal) {
            warn!("生命周期任务已退出，信号未送达: {:?}", e.0);
        }
    }

    async fn transition_to_error(&self, key: &StrategyKey, update: StateUpdate) {
        let with_status = update.clone().status(StrategyStatus::Error);
        match self.store.update(key, &with_status).await {
            Ok(_) => {}
            Err(StoreError::Transition(_)) => {
                if let Err(e) = self.store.update(key, &update).await {
                    error!("写入错误信息失败 {}: {}", key, e);
                }
            }
            Err(e) => error!("写入 ERROR 状态失败 {}: {}", key, e),
        }
    }

    fn publish_success(
        &self,
        key: &StrategyKey,
        action: OrderAction,
        result: &Result<ExecutionOutcome, ExecutionError>,
    ) {
        let Ok(ExecutionOutcome::Executed {
            broker_order_id,
            fill_price,
            position,
            realized_pnl,
            attempts,
            ..
        }) = result
        else {
            return;
        };
        let event_type = if action == OrderAction::SlSell {
            EventType::StopLossTriggered
        } else {
            EventType::OrderExecuted
        };
        self.event_bus.publish(
            &key.user_id,
            event_type,
            Some(&key.strategy_id),
            json!({
                "action": action.as_str(),
                "broker_order_id": broker_order_id,
                "fill_price": fill_price,
                "position": position.as_str(),
                "realized_pnl": realized_pnl,
                "attempts": attempts,
            }),
        );
        if action.is_exit() {
            self.event_bus.publish(
                &key.user_id,
                EventType::StrategyCompleted,
                Some(&key.strategy_id),
                json!({
                    "position": position.as_str(),
                    "exit_price": fill_price,
                    "realized_pnl": realized_pnl,
                }),
            );
        }
    }

    async fn write_audit(&self, record: AuditRecord) {
        if let Err(e) = self.audit.record(record).await {
            error!("审计记录写入失败: {}", e);
        }
    }

    /// 物化或重启运行时状态并置为 RUNNING
    pub async fn activate(
        &self,
        definition: &StrategyDefinition,
    ) -> Result<StrategyRuntimeState, ExecutionError> {
        let key = definition.key();
        let now = Utc::now();
        let state = match self.store.get(&key).await? {
            Some(existing) if existing.status == StrategyStatus::Stopped => {
                self.store
                    .update(&key, &StateUpdate::new().status(StrategyStatus::Running).started_at(now))
                    .await?
            }
            Some(existing) if existing.status == StrategyStatus::Running => existing,
            Some(existing) if existing.status == StrategyStatus::Error => {
                return Err(ExecutionError::Validation(format!(
                    "策略处于 ERROR，需人工处理: {}",
                    existing.last_error.unwrap_or_default()
                )));
            }
            _ => {
                let mut state = StrategyRuntimeState::from_definition(definition, now);
                StateUpdate::new()
                    .status(StrategyStatus::Running)
                    .started_at(now)
                    .apply(&mut state, now)
                    .map_err(StoreError::from)?;
                self.store.put(&state).await?;
                state
            }
        };
        self.event_bus.publish(
            &key.user_id,
            EventType::StrategyStarted,
            Some(&key.strategy_id),
            json!({
                "symbol": state.symbol,
                "buy_time": state.buy_time.to_string(),
                "sell_time": state.sell_time.to_string(),
                "stop_loss": state.stop_loss,
                "quantity": state.quantity,
                "broker": state.broker,
            }),
        );
        Ok(state)
    }

    /// RUNNING → STOPPED
    pub async fn stop(
        &self,
        key: &StrategyKey,
        reason: &str,
    ) -> Result<StrategyRuntimeState, ExecutionError> {
        let state = self
            .store
            .update(
                key,
                &StateUpdate::new()
                    .status(StrategyStatus::Stopped)
                    .stop_reason(reason),
            )
            .await?;
        self.event_bus.publish(
            &key.user_id,
            EventType::StrategyStopped,
            Some(&key.strategy_id),
            json!({
                "reason": reason,
                "position": state.position.as_str(),
            }),
        );
        Ok(state)
    }

    /// 非下单路径的错误（如触发时间越界）
    pub async fn fail(&self, key: &StrategyKey, kind: ErrorKind, message: &str) {
        error!(
            user_id = %key.user_id,
            strategy_id = %key.strategy_id,
            "策略进入错误状态 kind={}: {}",
            kind,
            message
        );
        self.transition_to_error(key, StateUpdate::new().last_error(message))
            .await;
        self.event_bus.publish(
            &key.user_id,
            EventType::StrategyError,
            Some(&key.strategy_id),
            json!({ "kind": kind.as_str(), "message": message }),
        );
        self.signal(LifecycleSignal::Failed {
            key: key.clone(),
            reason: message.to_string(),
        });
    }

    /// 删除运行时条目，返回最后一份快照
    pub async fn remove(
        &self,
        key: &StrategyKey,
    ) -> Result<Option<StrategyRuntimeState>, ExecutionError> {
        let removed = self.store.remove(key).await?;
        self.gates.remove(key);
        Ok(removed)
    }
}

#[async_trait]
impl FeedHealthListener for ExecutionEngine {
    async fn feed_degraded(&self, key: &StrategyKey, reason: &str) {
        let message = format!("{}: 止损保护降级，{}", FEED_ERROR_PREFIX, reason);
        if let Err(e) = self
            .store
            .update(key, &StateUpdate::new().last_error(message))
            .await
        {
            warn!("标注行情降级失败 {}: {}", key, e);
        }
    }

    async fn feed_restored(&self, key: &StrategyKey) {
        let Ok(Some(state)) = self.store.get(key).await else {
            return;
        };
        let feed_error = state
            .last_error
            .as_deref()
            .map(|e| e.starts_with(FEED_ERROR_PREFIX))
            .unwrap_or(false);
        if feed_error {
            if let Err(e) = self
                .store
                .update(key, &StateUpdate::new().clear_last_error())
                .await
            {
                warn!("清除行情降级标注失败 {}: {}", key, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn state(position: PositionState) -> StrategyRuntimeState {
        let definition = StrategyDefinition {
            strategy_id: "s1".to_string(),
            user_id: "u1".to_string(),
            name: None,
            symbol: "RELIANCE".to_string(),
            buy_time: NaiveTime::from_hms_opt(9, 20, 0).unwrap(),
            sell_time: NaiveTime::from_hms_opt(15, 10, 0).unwrap(),
            stop_loss: 2500.0,
            quantity: 10,
            broker: "paper".to_string(),
            status: StrategyStatus::Running,
        };
        let mut state = StrategyRuntimeState::from_definition(&definition, Utc::now());
        state.status = StrategyStatus::Running;
        state.position = position;
        state
    }

    #[test]
    fn test_preconditions() {
        assert!(check_preconditions(&state(PositionState::None), OrderAction::Buy).is_ok());
        assert!(check_preconditions(&state(PositionState::Bought), OrderAction::Buy).is_err());
        assert!(check_preconditions(&state(PositionState::None), OrderAction::Sell).is_err());
        assert!(check_preconditions(&state(PositionState::Bought), OrderAction::SlSell).is_ok());

        let mut triggered = state(PositionState::Bought);
        triggered.sl_triggered = true;
        assert!(check_preconditions(&triggered, OrderAction::SlSell).is_err());
        assert!(check_preconditions(&triggered, OrderAction::Sell).is_ok());

        let mut stopped = state(PositionState::None);
        stopped.status = StrategyStatus::Stopped;
        assert!(check_preconditions(&stopped, OrderAction::Buy).is_err());
    }

    #[test]
    fn test_exit_actions_share_locks() {
        assert_eq!(lock_actions(OrderAction::Sell), lock_actions(OrderAction::SlSell));
        assert_eq!(lock_actions(OrderAction::Buy), &[OrderAction::Buy]);
    }
}
