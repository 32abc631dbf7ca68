//! 行情接入
//!
//! 每个 (user, broker) 一条逻辑连接，symbol 订阅按策略引用计数。
//! 断线后指数退避重连，次数耗尽则对每个依赖策略发出 ERROR 事件并转入慢速重试。
//! 每条行情独立投递给止损监控与事件总线，互不阻塞；投给止损监控的只保留每个 symbol 的最新价。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app_config::settings::FeedSettings;
use crate::error::{BrokerError, ErrorKind};
use crate::trading::broker::{BrokerAdapter, BrokerSessions};
use crate::trading::model::{EventType, FeedMessage, PriceTick, RawTick, StrategyKey};
use crate::trading::services::event_bus::EventBus;

use super::backoff::ReconnectBackoff;
use super::normalizer::normalize_tick;
use super::subscription::SymbolSubscriptions;
use super::tick_channel::TickSender;

const FEED_CHANNEL_CAPACITY: usize = 1024;

/// 投递给止损监控的行情，带来源连接与订阅该 symbol 的策略
#[derive(Debug, Clone, PartialEq)]
pub struct FeedTick {
    pub user_id: String,
    pub broker: String,
    pub tick: PriceTick,
    pub strategies: Vec<StrategyKey>,
}

/// 行情健康状态回调（标注运行时状态）
#[async_trait]
pub trait FeedHealthListener: Send + Sync {
    async fn feed_degraded(&self, key: &StrategyKey, reason: &str);

    async fn feed_restored(&self, key: &StrategyKey);
}

type ConnectionKey = (String, String);

struct FeedConnection {
    user_id: String,
    broker: String,
    adapter: Arc<dyn BrokerAdapter>,
    subscriptions: Mutex<SymbolSubscriptions>,
    connected: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
struct IngestContext {
    settings: FeedSettings,
    event_bus: Arc<EventBus>,
    health: Arc<dyn FeedHealthListener>,
    tick_tx: TickSender,
}

pub struct MarketDataIngest {
    sessions: Arc<BrokerSessions>,
    context: IngestContext,
    connections: Mutex<HashMap<ConnectionKey, Arc<FeedConnection>>>,
}

impl MarketDataIngest {
    pub fn new(
        sessions: Arc<BrokerSessions>,
        settings: FeedSettings,
        event_bus: Arc<EventBus>,
        health: Arc<dyn FeedHealthListener>,
        tick_tx: TickSender,
    ) -> Self {
        Self {
            sessions,
            context: IngestContext {
                settings,
                event_bus,
                health,
                tick_tx,
            },
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn connection_key(user_id: &str, broker: &str) -> ConnectionKey {
        (user_id.to_string(), broker.to_lowercase())
    }

    /// 策略登记对 symbol 的需求；首个使用者触发券商订阅，必要时建立连接
    pub async fn subscribe(
        &self,
        consumer: &StrategyKey,
        broker: &str,
        symbol: &str,
    ) -> Result<(), BrokerError> {
        let mut connections = self.connections.lock().await;
        let key = Self::connection_key(&consumer.user_id, broker);

        let connection = match connections.get(&key) {
            Some(connection) => connection.clone(),
            None => {
                let adapter = self
                    .sessions
                    .get_or_connect(&consumer.user_id, broker)
                    .await?;
                let (shutdown, _) = watch::channel(false);
                let connection = Arc::new(FeedConnection {
                    user_id: consumer.user_id.clone(),
                    broker: broker.to_lowercase(),
                    adapter,
                    subscriptions: Mutex::new(SymbolSubscriptions::new()),
                    connected: AtomicBool::new(false),
                    shutdown,
                    task: Mutex::new(None),
                });
                connections.insert(key, connection.clone());
                connection
            }
        };

        {
            let mut subscriptions = connection.subscriptions.lock().await;
            let first = subscriptions.add(symbol, consumer);
            if first && connection.connected.load(Ordering::SeqCst) {
                if let Err(e) = connection.adapter.subscribe(&[symbol.to_string()]).await {
                    // 重连时会按订阅集合全量重订
                    warn!("行情订阅失败 symbol={} broker={}: {}", symbol, broker, e);
                }
            }
        }

        let mut task = connection.task.lock().await;
        if task.is_none() {
            let rx = connection.shutdown.subscribe();
            *task = Some(tokio::spawn(run_connection(
                connection.clone(),
                self.context.clone(),
                rx,
            )));
            info!(
                "行情连接启动 user_id={} broker={}",
                connection.user_id, connection.broker
            );
        }
        Ok(())
    }

    /// 策略释放 symbol；最后一个使用者离开时立即退订，连接无订阅时关闭
    pub async fn unsubscribe(&self, consumer: &StrategyKey, broker: &str, symbol: &str) {
        let mut connections = self.connections.lock().await;
        let key = Self::connection_key(&consumer.user_id, broker);
        let Some(connection) = connections.get(&key).cloned() else {
            return;
        };

        let now_empty = {
            let mut subscriptions = connection.subscriptions.lock().await;
            if subscriptions.remove(symbol, consumer)
                && connection.connected.load(Ordering::SeqCst)
            {
                if let Err(e) = connection.adapter.unsubscribe(&[symbol.to_string()]).await {
                    warn!("行情退订失败 symbol={} broker={}: {}", symbol, broker, e);
                }
                debug!("行情退订 symbol={} broker={}", symbol, broker);
            }
            subscriptions.is_empty()
        };

        if now_empty {
            connections.remove(&key);
            close_connection(&connection).await;
            info!(
                "行情连接关闭（无订阅） user_id={} broker={}",
                connection.user_id, connection.broker
            );
        }
    }

    pub async fn subscribed_symbols(&self, user_id: &str, broker: &str) -> Vec<String> {
        let connection = self
            .connections
            .lock()
            .await
            .get(&Self::connection_key(user_id, broker))
            .cloned();
        match connection {
            Some(connection) => connection.subscriptions.lock().await.symbols(),
            None => Vec::new(),
        }
    }

    pub async fn is_connected(&self, user_id: &str, broker: &str) -> bool {
        self.connections
            .lock()
            .await
            .get(&Self::connection_key(user_id, broker))
            .map(|c| c.connected.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// 关闭全部连接
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<FeedConnection>> = {
            let mut guard = self.connections.lock().await;
            guard.drain().map(|(_, c)| c).collect()
        };
        for connection in connections {
            close_connection(&connection).await;
        }
        info!("行情接入已关闭");
    }
}

async fn close_connection(connection: &FeedConnection) {
    let _ = connection.shutdown.send(true);
    connection.connected.store(false, Ordering::SeqCst);
    if let Some(handle) = connection.task.lock().await.take() {
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                error!("行情连接任务异常退出: {}", e);
            }
        }
    }
}

enum PumpExit {
    Shutdown,
    Disconnected(String),
}

async fn run_connection(
    connection: Arc<FeedConnection>,
    context: IngestContext,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = ReconnectBackoff::from_settings(&context.settings);
    let mut degraded = false;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        let connect_result = {
            let subscriptions = connection.subscriptions.lock().await;
            let result = connection
                .adapter
                .stream_ticks(&subscriptions.symbols(), tx)
                .await;
            if result.is_ok() {
                connection.connected.store(true, Ordering::SeqCst);
            }
            result
        };

        let last_error = match connect_result {
            Ok(()) => {
                backoff.reset();
                info!(
                    "行情已连接 user_id={} broker={}",
                    connection.user_id, connection.broker
                );
                if degraded {
                    degraded = false;
                    announce_restored(&connection, &context).await;
                }
                match pump(&connection, &context, rx, &mut shutdown).await {
                    PumpExit::Shutdown => return,
                    PumpExit::Disconnected(reason) => {
                        connection.connected.store(false, Ordering::SeqCst);
                        warn!(
                            "行情断开 user_id={} broker={}: {}",
                            connection.user_id, connection.broker, reason
                        );
                        reason
                    }
                }
            }
            Err(e) => {
                warn!(
                    "行情连接失败 user_id={} broker={} attempt={}: {}",
                    connection.user_id,
                    connection.broker,
                    backoff.attempt(),
                    e
                );
                e.to_string()
            }
        };

        let delay = match backoff.next_delay() {
            Some(delay) => delay,
            None => {
                if !degraded {
                    degraded = true;
                    announce_degraded(&connection, &context, &last_error).await;
                }
                context.settings.slow_retry
            }
        };

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn pump(
    connection: &FeedConnection,
    context: &IngestContext,
    mut rx: mpsc::Receiver<FeedMessage>,
    shutdown: &mut watch::Receiver<bool>,
) -> PumpExit {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return PumpExit::Shutdown,
            message = rx.recv() => match message {
                Some(FeedMessage::Tick(raw)) => dispatch(connection, context, &raw).await,
                Some(FeedMessage::Disconnected(reason)) => return PumpExit::Disconnected(reason),
                None => return PumpExit::Disconnected("行情通道已关闭".to_string()),
            },
        }
    }
}

async fn dispatch(connection: &FeedConnection, context: &IngestContext, raw: &RawTick) {
    let Some(tick) = normalize_tick(raw) else {
        return;
    };
    let strategies = connection
        .subscriptions
        .lock()
        .await
        .consumers_of(&tick.symbol);
    if strategies.is_empty() {
        return;
    }

    let feed_tick = FeedTick {
        user_id: connection.user_id.clone(),
        broker: connection.broker.clone(),
        tick: tick.clone(),
        strategies,
    };
    if !context.tick_tx.send(feed_tick) {
        debug!("止损监控已停止，行情未投递: {}", tick.symbol);
    }

    context.event_bus.publish(
        &connection.user_id,
        EventType::PriceUpdate,
        None,
        json!({
            "symbol": tick.symbol,
            "last_traded_price": tick.last_traded_price,
            "observed_at": tick.observed_at,
        }),
    );
}

async fn announce_degraded(connection: &FeedConnection, context: &IngestContext, reason: &str) {
    let consumers = connection.subscriptions.lock().await.consumers();
    error!(
        "行情重连次数耗尽，止损保护降级 user_id={} broker={} strategies={}",
        connection.user_id,
        connection.broker,
        consumers.len()
    );
    for key in consumers {
        context.event_bus.publish(
            &key.user_id,
            EventType::StrategyError,
            Some(&key.strategy_id),
            json!({
                "kind": ErrorKind::FeedDisconnected.as_str(),
                "broker": connection.broker,
                "message": reason,
            }),
        );
        context.health.feed_degraded(&key, reason).await;
    }
}

async fn announce_restored(connection: &FeedConnection, context: &IngestContext) {
    let consumers = connection.subscriptions.lock().await.consumers();
    info!(
        "行情恢复 user_id={} broker={} strategies={}",
        connection.user_id,
        connection.broker,
        consumers.len()
    );
    for key in consumers {
        context.event_bus.publish(
            &key.user_id,
            EventType::FeedRestored,
            Some(&key.strategy_id),
            json!({ "broker": connection.broker }),
        );
        context.health.feed_restored(&key).await;
    }
}
