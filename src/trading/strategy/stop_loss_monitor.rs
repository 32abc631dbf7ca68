//! 止损监控
//!
//! 每条行情只读取订阅该 symbol 的策略状态，持仓中且价格跌破止损即提交 SL_SELL。
//! 本地的在途标记只是快速路径，真正的去重靠执行引擎的锁与 sl_triggered 复核。

use std::sync::Arc;

use dashmap::DashSet;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ExecutionError;
use crate::trading::market::{FeedTick, TickReceiver};
use crate::trading::model::{OrderAction, StrategyKey};

use super::execution_engine::{ExecutionEngine, ExecutionOutcome};

pub struct StopLossMonitor {
    engine: Arc<ExecutionEngine>,
    in_flight: Arc<DashSet<StrategyKey>>,
}

impl StopLossMonitor {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self {
            engine,
            in_flight: Arc::new(DashSet::new()),
        }
    }

    /// 处理一条行情，返回本次提交的止损任务
    pub async fn handle_tick(&self, feed_tick: &FeedTick) -> Vec<JoinHandle<()>> {
        let FeedTick {
            user_id,
            broker,
            tick,
            strategies,
        } = feed_tick;
        let price = tick.last_traded_price;

        let store = self.engine.store();
        let snapshots = join_all(strategies.iter().map(|key| store.get(key))).await;
        let mut candidates = Vec::new();
        for (key, snapshot) in strategies.iter().zip(snapshots) {
            match snapshot {
                Ok(Some(state))
                    if state.user_id == *user_id
                        && state.broker.eq_ignore_ascii_case(broker)
                        && state.is_stop_loss_candidate(&tick.symbol) =>
                {
                    candidates.push(state)
                }
                Ok(_) => {}
                Err(e) => error!("读取止损候选失败 {} symbol={}: {}", key, tick.symbol, e),
            }
        }

        let mut submitted = Vec::new();
        for state in candidates {
            if price > state.stop_loss {
                continue;
            }
            let key = state.key();
            if !self.in_flight.insert(key.clone()) {
                debug!("止损已在途，忽略重复行情 {} price={}", key, price);
                continue;
            }
            info!(
                user_id = %key.user_id,
                strategy_id = %key.strategy_id,
                symbol = %tick.symbol,
                "触发止损 price={} stop_loss={}",
                price,
                state.stop_loss
            );
            let engine = self.engine.clone();
            let in_flight = self.in_flight.clone();
            submitted.push(tokio::spawn(async move {
                match engine.execute(&key, OrderAction::SlSell).await {
                    Ok(ExecutionOutcome::Executed {
                        fill_price,
                        realized_pnl,
                        ..
                    }) => {
                        info!(
                            "止损成交 {} fill_price={} pnl={:?}",
                            key, fill_price, realized_pnl
                        );
                    }
                    Ok(ExecutionOutcome::NoOp { reason }) => {
                        debug!("止损无需执行 {}: {}", key, reason);
                    }
                    Err(ExecutionError::Validation(reason)) => {
                        debug!("止损跳过 {}: {}", key, reason);
                    }
                    Err(e @ ExecutionError::DuplicateOrder { .. }) => {
                        debug!("止损与其他卖出冲突 {}: {}", key, e);
                    }
                    Err(e) => warn!("止损执行失败 {}: {}", key, e),
                }
                in_flight.remove(&key);
            }));
        }
        submitted
    }

    /// 消费行情通道直到关闭
    pub async fn run(self: Arc<Self>, mut ticks: TickReceiver) {
        info!("止损监控启动");
        while let Some(feed_tick) = ticks.recv().await {
            self.handle_tick(&feed_tick).await;
        }
        info!("止损监控退出");
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}
