//! 策略管理器
//!
//! 对外暴露启动、停止、查询、紧急停止与对账。
//! 启停与收尾在同一把互斥锁下串行执行，运行时状态的写入全部委托给执行引擎。
//! 进入 ERROR 的策略撤掉触发器与行情订阅，但运行时条目保留到人工停止为止。

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::error::{ErrorKind, StrategyManagerError};
use crate::trading::cache::reconcile_runtime_states;
use crate::trading::market::MarketDataIngest;
use crate::trading::model::{
    OrderAction, StrategyDefinition, StrategyKey, StrategyRuntimeState, StrategyStatus,
};
use crate::trading::services::definition_store::StrategyDefinitionStore;

use super::execution_engine::{ExecutionEngine, LifecycleSignal};
use super::scheduler::StrategyScheduler;

/// 手动停止的原因
pub const STOP_REASON_MANUAL: &str = "manual";

/// 本进程接管的策略
#[derive(Debug, Clone)]
struct RunningStrategy {
    key: StrategyKey,
    broker: String,
    symbol: String,
    /// ERROR 后挂起：不再调度、不再订阅行情，等待人工停止
    parked: bool,
}

impl RunningStrategy {
    fn new(definition: &StrategyDefinition, parked: bool) -> Self {
        Self {
            key: definition.key(),
            broker: definition.broker.clone(),
            symbol: definition.symbol.clone(),
            parked,
        }
    }
}

/// 紧急停止结果，逐个策略尽力而为
#[derive(Debug, Default, Clone, Serialize)]
pub struct EmergencyStopReport {
    pub stopped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconcileReport {
    pub removed: Vec<StrategyKey>,
    pub rematerialized: Vec<String>,
    /// 保留原样、等待人工处理的 ERROR 策略
    pub errored: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct StrategyManager {
    definitions: Arc<dyn StrategyDefinitionStore>,
    engine: Arc<ExecutionEngine>,
    scheduler: Arc<StrategyScheduler>,
    ingest: Arc<MarketDataIngest>,
    running: DashMap<String, RunningStrategy>,
    ops: Mutex<()>,
}

impl StrategyManager {
    pub fn new(
        definitions: Arc<dyn StrategyDefinitionStore>,
        engine: Arc<ExecutionEngine>,
        scheduler: Arc<StrategyScheduler>,
        ingest: Arc<MarketDataIngest>,
    ) -> Self {
        Self {
            definitions,
            engine,
            scheduler,
            ingest,
            running: DashMap::new(),
            ops: Mutex::new(()),
        }
    }

    /// 启动策略：订阅行情、物化运行时状态、注册触发器
    pub async fn start_strategy(
        &self,
        strategy_id: &str,
    ) -> Result<StrategyRuntimeState, StrategyManagerError> {
        let _guard = self.ops.lock().await;
        if let Some(entry) = self.running.get(strategy_id) {
            return Err(if entry.parked {
                StrategyManagerError::InError {
                    strategy_id: strategy_id.to_string(),
                }
            } else {
                StrategyManagerError::AlreadyRunning {
                    strategy_id: strategy_id.to_string(),
                }
            });
        }
        let definition = self.definitions.load(strategy_id).await?.ok_or_else(|| {
            StrategyManagerError::DefinitionNotFound {
                strategy_id: strategy_id.to_string(),
            }
        })?;
        if self.adopt_if_errored(&definition).await? {
            return Err(StrategyManagerError::InError {
                strategy_id: strategy_id.to_string(),
            });
        }
        self.materialize(&definition).await
    }

    async fn materialize(
        &self,
        definition: &StrategyDefinition,
    ) -> Result<StrategyRuntimeState, StrategyManagerError> {
        definition
            .validate()
            .map_err(|reason| StrategyManagerError::InvalidDefinition {
                strategy_id: definition.strategy_id.clone(),
                reason,
            })?;
        self.scheduler.check_window(definition.buy_time)?;
        self.scheduler.check_window(definition.sell_time)?;

        let key = definition.key();
        self.ingest
            .subscribe(&key, &definition.broker, &definition.symbol)
            .await?;

        let state = match self.engine.activate(definition).await {
            Ok(state) => state,
            Err(e) => {
                self.ingest
                    .unsubscribe(&key, &definition.broker, &definition.symbol)
                    .await;
                return Err(e.into());
            }
        };
        self.running.insert(
            definition.strategy_id.clone(),
            RunningStrategy::new(definition, false),
        );

        if let Err(e) = self.scheduler.register(&state) {
            // 时段已预先校验，这里只会是找不到下一个交易日
            self.engine
                .fail(&key, ErrorKind::Validation, &e.to_string())
                .await;
            return Err(e.into());
        }
        self.definitions
            .set_status(&definition.strategy_id, StrategyStatus::Running)
            .await?;

        info!(
            user_id = %key.user_id,
            strategy_id = %key.strategy_id,
            symbol = %definition.symbol,
            "策略已启动 position={}",
            state.position
        );
        Ok(state)
    }

    /// 运行时条目处于 ERROR 时只登记为挂起，不重建也不覆盖
    async fn adopt_if_errored(
        &self,
        definition: &StrategyDefinition,
    ) -> Result<bool, StrategyManagerError> {
        let existing = self.engine.store().get(&definition.key()).await?;
        match existing {
            Some(state) if state.status == StrategyStatus::Error => {
                warn!(
                    user_id = %state.user_id,
                    strategy_id = %state.strategy_id,
                    "策略处于 ERROR，保留待人工处理 manual={}",
                    state.needs_manual_intervention
                );
                self.running.insert(
                    definition.strategy_id.clone(),
                    RunningStrategy::new(definition, true),
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// 停止策略；exit_open_position 为 true 时先卖出未平仓头寸
    pub async fn stop_strategy(
        &self,
        strategy_id: &str,
        exit_open_position: bool,
    ) -> Result<StrategyRuntimeState, StrategyManagerError> {
        self.stop_with_reason(strategy_id, exit_open_position, STOP_REASON_MANUAL)
            .await
    }

    async fn stop_with_reason(
        &self,
        strategy_id: &str,
        exit_open_position: bool,
        reason: &str,
    ) -> Result<StrategyRuntimeState, StrategyManagerError> {
        let _guard = self.ops.lock().await;
        let entry = self
            .running
            .get(strategy_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StrategyManagerError::NotRunning {
                strategy_id: strategy_id.to_string(),
            })?;
        let key = entry.key.clone();

        // 先撤触发器，停止之后不会再有定时下单
        self.scheduler.cancel(&key);

        let state = self.engine.store().get(&key).await?;
        if let Some(state) = &state {
            if exit_open_position && state.is_running() && state.has_open_position() {
                match self.engine.execute(&key, OrderAction::Sell).await {
                    Ok(outcome) => info!("停止前平仓 {}: {:?}", key, outcome),
                    // 可能止损卖出正在途中，收尾时会等它完成
                    Err(e) => warn!("停止前平仓失败 {}: {}", key, e),
                }
            }
        }

        let current = self.engine.store().get(&key).await?;
        if current.as_ref().map(|s| s.is_running()).unwrap_or(false) {
            self.engine.stop(&key, reason).await?;
        }

        let final_state = self.finalize(&entry).await?;
        final_state.ok_or(StrategyManagerError::NotRunning {
            strategy_id: strategy_id.to_string(),
        })
    }

    /// 收尾：撤触发器、释放行情订阅、等待在途执行、归档并删除运行时状态
    async fn finalize(
        &self,
        entry: &RunningStrategy,
    ) -> Result<Option<StrategyRuntimeState>, StrategyManagerError> {
        let key = &entry.key;
        self.scheduler.cancel(key);
        self.ingest
            .unsubscribe(key, &entry.broker, &entry.symbol)
            .await;

        let drained = self.engine.drain(key).await;
        let final_state = self.engine.remove(key).await?;
        drop(drained);
        self.running.remove(&key.strategy_id);

        if let Some(state) = &final_state {
            self.definitions.record_final_state(state).await?;
            info!(
                user_id = %key.user_id,
                strategy_id = %key.strategy_id,
                "策略收尾 status={} position={} pnl={:?}",
                state.status,
                state.position,
                state.realized_pnl
            );
        }
        Ok(final_state)
    }

    /// 运行中返回实时状态，已结束返回最后归档的状态
    pub async fn get_runtime_state(
        &self,
        strategy_id: &str,
    ) -> Result<StrategyRuntimeState, StrategyManagerError> {
        let key = self.running.get(strategy_id).map(|e| e.key.clone());
        if let Some(key) = key {
            if let Some(state) = self.engine.store().get(&key).await? {
                return Ok(state);
            }
        }
        self.definitions
            .last_final_state(strategy_id)
            .await?
            .ok_or_else(|| StrategyManagerError::NotRunning {
                strategy_id: strategy_id.to_string(),
            })
    }

    /// 停止用户所有运行中的策略（不平仓），单个失败不影响其他
    pub async fn emergency_stop(&self, user_id: &str, reason: &str) -> EmergencyStopReport {
        let targets: Vec<String> = self
            .running
            .iter()
            .filter(|e| e.value().key.user_id == user_id)
            .map(|e| e.value().key.strategy_id.clone())
            .collect();
        let stop_reason = format!("emergency: {}", reason);
        warn!(
            "紧急停止 user_id={} strategies={} reason={}",
            user_id,
            targets.len(),
            reason
        );

        let mut report = EmergencyStopReport::default();
        for strategy_id in targets {
            match self.stop_with_reason(&strategy_id, false, &stop_reason).await {
                Ok(_) => report.stopped.push(strategy_id),
                Err(e) => {
                    error!("紧急停止失败 strategy_id={}: {}", strategy_id, e);
                    report.failed.push((strategy_id, e.to_string()));
                }
            }
        }
        report
    }

    /// 以定义存储为准修复运行时状态
    pub async fn reconcile(&self) -> Result<ReconcileReport, StrategyManagerError> {
        let _guard = self.ops.lock().await;
        let running_definitions = self.definitions.list_running().await?;
        let diff = reconcile_runtime_states(self.engine.store(), &running_definitions).await?;

        let mut report = ReconcileReport {
            removed: diff.removed.clone(),
            ..Default::default()
        };
        for key in &diff.removed {
            self.scheduler.cancel(key);
            if let Some((_, entry)) = self.running.remove(&key.strategy_id) {
                self.ingest
                    .unsubscribe(key, &entry.broker, &entry.symbol)
                    .await;
            }
        }

        // 缺少运行时条目的，以及状态还在但本进程未接管的
        for definition in &running_definitions {
            if self.running.contains_key(&definition.strategy_id) {
                continue;
            }
            match self.adopt_if_errored(definition).await {
                Ok(true) => {
                    report.errored.push(definition.strategy_id.clone());
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    report
                        .failed
                        .push((definition.strategy_id.clone(), e.to_string()));
                    continue;
                }
            }
            match self.materialize(definition).await {
                Ok(_) => report.rematerialized.push(definition.strategy_id.clone()),
                Err(e) => {
                    error!("对账重建失败 strategy_id={}: {}", definition.strategy_id, e);
                    report
                        .failed
                        .push((definition.strategy_id.clone(), e.to_string()));
                }
            }
        }

        if !report.removed.is_empty()
            || !report.rematerialized.is_empty()
            || !report.errored.is_empty()
        {
            info!(
                "对账完成 removed={} rematerialized={} errored={} failed={}",
                report.removed.len(),
                report.rematerialized.len(),
                report.errored.len(),
                report.failed.len()
            );
        }
        Ok(report)
    }

    /// 消费执行引擎的生命周期信号：完成的策略收尾归档，出错的策略挂起
    pub async fn run_lifecycle(self: Arc<Self>, mut signals: mpsc::UnboundedReceiver<LifecycleSignal>) {
        while let Some(signal) = signals.recv().await {
            match signal {
                LifecycleSignal::Completed(key) => {
                    if let Err(e) = self.finish(&key).await {
                        error!("策略收尾失败 {}: {}", key, e);
                    }
                }
                LifecycleSignal::Failed { key, reason } => {
                    warn!("策略出错，挂起待人工处理 {}: {}", key, reason);
                    self.park(&key).await;
                }
            }
        }
    }

    /// 撤触发器并释放行情订阅，运行时条目与 ERROR 状态原样保留
    async fn park(&self, key: &StrategyKey) {
        let _guard = self.ops.lock().await;
        let entry = match self.running.get(&key.strategy_id) {
            Some(entry) if entry.key == *key && !entry.parked => entry.value().clone(),
            _ => return,
        };
        self.scheduler.cancel(key);
        self.ingest
            .unsubscribe(key, &entry.broker, &entry.symbol)
            .await;
        if let Some(mut entry) = self.running.get_mut(&key.strategy_id) {
            entry.parked = true;
        }
        warn!(
            "策略进入 ERROR，已撤销触发器与行情订阅，等待人工停止: {}",
            key
        );
    }

    async fn finish(&self, key: &StrategyKey) -> Result<(), StrategyManagerError> {
        let _guard = self.ops.lock().await;
        let entry = match self.running.get(&key.strategy_id) {
            Some(entry) if entry.key == *key => entry.value().clone(),
            // 已被 stop 收尾
            _ => return Ok(()),
        };
        self.finalize(&entry).await?;
        Ok(())
    }

    pub fn is_running(&self, strategy_id: &str) -> bool {
        self.running
            .get(strategy_id)
            .map(|e| !e.parked)
            .unwrap_or(false)
    }

    pub fn running_strategies(&self) -> Vec<StrategyKey> {
        self.running
            .iter()
            .filter(|e| !e.parked)
            .map(|e| e.key.clone())
            .collect()
    }

    /// ERROR 挂起、等待人工停止的策略
    pub fn errored_strategies(&self) -> Vec<StrategyKey> {
        self.running
            .iter()
            .filter(|e| e.parked)
            .map(|e| e.key.clone())
            .collect()
    }

    /// 进程退出：撤销全部触发器并关闭行情连接，运行时状态保留供重启后对账
    pub async fn shutdown(&self) {
        self.scheduler.cancel_all();
        self.ingest.shutdown().await;
    }
}
