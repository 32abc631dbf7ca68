//! 模拟券商
//!
//! 以最新价成交（可设为先挂单若干次查询后再成交），可脚本化注入失败、断开行情，用于本地运行与测试

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::BrokerError;
use crate::trading::model::{
    BrokerHolding, BrokerPosition, BrokerProfile, FeedMessage, OrderIntent, OrderResult,
    OrderSide, OrderStatus, RawTick,
};

use super::{BrokerAdapter, BrokerCredentials};

struct PendingFill {
    remaining_polls: usize,
    intent: OrderIntent,
    price: f64,
}

pub struct PaperBroker {
    online: AtomicBool,
    connected: AtomicBool,
    feed_available: AtomicBool,
    prices: DashMap<String, f64>,
    subscribed: Mutex<HashSet<String>>,
    feed: Mutex<Option<mpsc::Sender<FeedMessage>>>,
    scripted_failures: Mutex<VecDeque<BrokerError>>,
    order_latency_ms: AtomicU64,
    place_order_calls: AtomicUsize,
    stream_attempts: AtomicUsize,
    next_order_id: AtomicU64,
    filled: Mutex<Vec<OrderIntent>>,
    results: DashMap<String, OrderResult>,
    pending_polls: AtomicUsize,
    pending: DashMap<String, PendingFill>,
    status_calls: AtomicUsize,
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperBroker {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            feed_available: AtomicBool::new(true),
            prices: DashMap::new(),
            subscribed: Mutex::new(HashSet::new()),
            feed: Mutex::new(None),
            scripted_failures: Mutex::new(VecDeque::new()),
            order_latency_ms: AtomicU64::new(0),
            place_order_calls: AtomicUsize::new(0),
            stream_attempts: AtomicUsize::new(0),
            next_order_id: AtomicU64::new(1),
            filled: Mutex::new(Vec::new()),
            results: DashMap::new(),
            pending_polls: AtomicUsize::new(0),
            pending: DashMap::new(),
            status_calls: AtomicUsize::new(0),
        }
    }

    /// 更新最新价；已订阅时推送一条行情
    pub async fn set_price(&self, symbol: &str, price: f64) {
        self.prices.insert(symbol.to_string(), price);
        if !self.subscribed.lock().await.contains(symbol) {
            return;
        }
        let payload = json!({
            "symbol": symbol,
            "ltp": price,
            "ts": Utc::now().timestamp_millis(),
        });
        self.push_raw(payload).await;
    }

    /// 直接推送一条原始行情
    pub async fn push_raw(&self, payload: serde_json::Value) -> bool {
        let sender = self.feed.lock().await.clone();
        match sender {
            Some(sender) => sender
                .send(FeedMessage::Tick(RawTick::new(payload)))
                .await
                .is_ok(),
            None => false,
        }
    }

    /// 模拟行情断开
    pub async fn drop_feed(&self, reason: &str) {
        if let Some(sender) = self.feed.lock().await.take() {
            let _ = sender
                .send(FeedMessage::Disconnected(reason.to_string()))
                .await;
        }
    }

    /// 控制行情重连是否成功
    pub fn set_feed_available(&self, available: bool) {
        self.feed_available.store(available, Ordering::SeqCst);
    }

    /// 控制券商是否可达（影响 connect 与下单）
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// 依次消耗的下单失败
    pub async fn fail_next_orders(&self, failures: Vec<BrokerError>) {
        self.scripted_failures.lock().await.extend(failures);
    }

    pub fn set_order_latency(&self, latency: Duration) {
        self.order_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// 之后的订单先返回 PENDING，被查询 `polls` 次后成交；0 表示立即成交
    pub fn set_pending_polls(&self, polls: usize) {
        self.pending_polls.store(polls, Ordering::SeqCst);
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn place_order_calls(&self) -> usize {
        self.place_order_calls.load(Ordering::SeqCst)
    }

    pub fn stream_attempts(&self) -> usize {
        self.stream_attempts.load(Ordering::SeqCst)
    }

    pub async fn filled_orders(&self) -> Vec<OrderIntent> {
        self.filled.lock().await.clone()
    }

    pub async fn subscribed_symbols(&self) -> HashSet<String> {
        self.subscribed.lock().await.clone()
    }

    fn ensure_online(&self) -> Result<(), BrokerError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected("paper 券商不可达".to_string()));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected("paper 未登录".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn connect(&self, credentials: &BrokerCredentials) -> Result<(), BrokerError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected("paper 券商不可达".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        debug!("paper 券商已连接: client_id={}", credentials.client_id);
        Ok(())
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<OrderResult, BrokerError> {
        self.place_order_calls.fetch_add(1, Ordering::SeqCst);

        let latency = self.order_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.ensure_online()?;
        if let Some(failure) = self.scripted_failures.lock().await.pop_front() {
            warn!("paper 注入下单失败: {}", failure);
            return Err(failure);
        }

        let price = match intent.limit_price {
            Some(price) => price,
            None => self
                .prices
                .get(&intent.symbol)
                .map(|p| *p.value())
                .ok_or_else(|| BrokerError::Rejected(format!("无最新价: {}", intent.symbol)))?,
        };

        let order_id = format!("PAPER-{}", self.next_order_id.fetch_add(1, Ordering::SeqCst));
        let polls = self.pending_polls.load(Ordering::SeqCst);
        if polls > 0 {
            let result = OrderResult {
                broker_order_id: order_id.clone(),
                status: OrderStatus::Pending,
                fill_price: None,
                error: None,
            };
            self.results.insert(order_id.clone(), result.clone());
            self.pending.insert(
                order_id.clone(),
                PendingFill {
                    remaining_polls: polls,
                    intent: intent.clone(),
                    price,
                },
            );
            info!("paper 挂单: order_id={} symbol={}", order_id, intent.symbol);
            return Ok(result);
        }

        let result = OrderResult::filled(order_id.clone(), price);
        self.results.insert(order_id.clone(), result.clone());
        self.filled.lock().await.push(intent.clone());
        info!(
            "paper 成交: order_id={} symbol={} side={} qty={} price={}",
            order_id,
            intent.symbol,
            intent.side.as_str(),
            intent.quantity,
            price
        );
        Ok(result)
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        self.ensure_online()?;
        let status = self.results.get(broker_order_id).map(|r| r.status);
        match status {
            Some(OrderStatus::Filled) => Err(BrokerError::Rejected(format!(
                "订单已成交，无法撤单: {}",
                broker_order_id
            ))),
            Some(_) => {
                self.results.remove(broker_order_id);
                self.pending.remove(broker_order_id);
                Ok(())
            }
            None => Err(BrokerError::Rejected(format!("订单不存在: {}", broker_order_id))),
        }
    }

    async fn get_order_status(&self, broker_order_id: &str) -> Result<OrderResult, BrokerError> {
        self.ensure_online()?;
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let settled = match self.pending.get_mut(broker_order_id) {
            Some(mut fill) => {
                fill.remaining_polls = fill.remaining_polls.saturating_sub(1);
                fill.remaining_polls == 0
            }
            None => false,
        };
        if settled {
            if let Some((_, fill)) = self.pending.remove(broker_order_id) {
                self.results.insert(
                    broker_order_id.to_string(),
                    OrderResult::filled(broker_order_id, fill.price),
                );
                self.filled.lock().await.push(fill.intent);
            }
        }
        self.results
            .get(broker_order_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| BrokerError::Rejected(format!("订单不存在: {}", broker_order_id)))
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        self.ensure_online()?;
        let filled = self.filled.lock().await;
        // symbol -> (净数量, 买入金额, 买入数量)
        let mut book: HashMap<String, (i64, f64, i64)> = HashMap::new();
        for intent in filled.iter() {
            let price = intent
                .limit_price
                .or_else(|| self.prices.get(&intent.symbol).map(|p| *p.value()))
                .unwrap_or_default();
            let entry = book.entry(intent.symbol.clone()).or_default();
            match intent.side {
                OrderSide::Buy => {
                    entry.0 += intent.quantity as i64;
                    entry.1 += price * intent.quantity as f64;
                    entry.2 += intent.quantity as i64;
                }
                OrderSide::Sell => entry.0 -= intent.quantity as i64,
            }
        }
        Ok(book
            .into_iter()
            .filter(|(_, (net, _, _))| *net != 0)
            .map(|(symbol, (net, cost, bought))| BrokerPosition {
                symbol,
                quantity: net,
                average_price: (bought > 0).then(|| cost / bought as f64),
            })
            .collect())
    }

    /// 模拟账户只有当日持仓，没有长期持股
    async fn get_holdings(&self) -> Result<Vec<BrokerHolding>, BrokerError> {
        self.ensure_online()?;
        Ok(Vec::new())
    }

    async fn get_profile(&self) -> Result<BrokerProfile, BrokerError> {
        self.ensure_online()?;
        Ok(BrokerProfile {
            client_id: "paper".to_string(),
            name: Some("Paper Trading".to_string()),
            email: None,
        })
    }

    async fn get_last_price(&self, symbol: &str) -> Result<f64, BrokerError> {
        self.prices
            .get(symbol)
            .map(|p| *p.value())
            .ok_or_else(|| BrokerError::Rejected(format!("无最新价: {}", symbol)))
    }

    async fn stream_ticks(
        &self,
        symbols: &[String],
        sink: mpsc::Sender<FeedMessage>,
    ) -> Result<(), BrokerError> {
        self.stream_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.feed_available.load(Ordering::SeqCst) {
            return Err(BrokerError::Disconnected("paper 行情不可用".to_string()));
        }
        {
            let mut subscribed = self.subscribed.lock().await;
            subscribed.clear();
            subscribed.extend(symbols.iter().cloned());
        }
        *self.feed.lock().await = Some(sink);
        debug!("paper 行情已连接, symbols={:?}", symbols);
        Ok(())
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<(), BrokerError> {
        self.subscribed.lock().await.extend(symbols.iter().cloned());
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<(), BrokerError> {
        let mut subscribed = self.subscribed.lock().await;
        for symbol in symbols {
            subscribed.remove(symbol);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::model::OrderAction;
    use approx::assert_relative_eq;

    #[tokio::test]
    async fn test_fill_at_last_price() {
        let broker = PaperBroker::new();
        broker.connect(&BrokerCredentials::default()).await.unwrap();
        broker.set_price("RELIANCE", 2600.0).await;

        let intent = OrderIntent::market("s1", "u1", "RELIANCE", OrderAction::Buy, 10);
        let result = broker.place_order(&intent).await.unwrap();
        assert_eq!(result.status, OrderStatus::Filled);
        assert_relative_eq!(result.fill_price.unwrap(), 2600.0);

        let positions = broker.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 10);
        assert!(broker.cancel_order(&result.broker_order_id).await.is_err());
    }

    #[tokio::test]
    async fn test_pending_order_fills_after_polls() {
        let broker = PaperBroker::new();
        broker.connect(&BrokerCredentials::default()).await.unwrap();
        broker.set_price("RELIANCE", 2600.0).await;
        broker.set_pending_polls(2);

        let intent = OrderIntent::market("s1", "u1", "RELIANCE", OrderAction::Buy, 10);
        let placed = broker.place_order(&intent).await.unwrap();
        assert_eq!(placed.status, OrderStatus::Pending);
        assert!(placed.fill_price.is_none());
        assert!(broker.get_positions().await.unwrap().is_empty());

        let first = broker.get_order_status(&placed.broker_order_id).await.unwrap();
        assert_eq!(first.status, OrderStatus::Pending);
        let second = broker.get_order_status(&placed.broker_order_id).await.unwrap();
        assert_eq!(second.status, OrderStatus::Filled);
        assert_relative_eq!(second.fill_price.unwrap(), 2600.0);
        assert_eq!(broker.get_positions().await.unwrap()[0].quantity, 10);
        assert_eq!(broker.status_calls(), 2);
    }

    #[tokio::test]
    async fn test_pending_order_can_be_cancelled() {
        let broker = PaperBroker::new();
        broker.connect(&BrokerCredentials::default()).await.unwrap();
        broker.set_price("TCS", 3500.0).await;
        broker.set_pending_polls(usize::MAX);

        let intent = OrderIntent::market("s1", "u1", "TCS", OrderAction::Buy, 1);
        let placed = broker.place_order(&intent).await.unwrap();
        broker.cancel_order(&placed.broker_order_id).await.unwrap();
        assert!(broker.get_order_status(&placed.broker_order_id).await.is_err());
        assert!(broker.get_holdings().await.unwrap().is_empty());
        assert_eq!(broker.get_profile().await.unwrap().client_id, "paper");
    }

    #[tokio::test]
    async fn test_scripted_failure_and_offline() {
        let broker = PaperBroker::new();
        broker.connect(&BrokerCredentials::default()).await.unwrap();
        broker.set_price("TCS", 3500.0).await;
        broker
            .fail_next_orders(vec![BrokerError::Transient("502".into())])
            .await;

        let intent = OrderIntent::market("s1", "u1", "TCS", OrderAction::Buy, 1);
        assert!(matches!(
            broker.place_order(&intent).await,
            Err(BrokerError::Transient(_))
        ));
        assert!(broker.place_order(&intent).await.is_ok());

        broker.set_online(false);
        assert!(matches!(
            broker.place_order(&intent).await,
            Err(BrokerError::NotConnected(_))
        ));
        assert_eq!(broker.place_order_calls(), 3);
    }

    #[tokio::test]
    async fn test_feed_only_pushes_subscribed_symbols() {
        let broker = PaperBroker::new();
        let (tx, mut rx) = mpsc::channel(8);
        broker
            .stream_ticks(&["INFY".to_string()], tx)
            .await
            .unwrap();

        broker.set_price("TCS", 3500.0).await;
        broker.set_price("INFY", 1500.0).await;
        match rx.recv().await {
            Some(FeedMessage::Tick(raw)) => assert_eq!(raw.payload["symbol"], "INFY"),
            other => panic!("unexpected message: {:?}", other),
        }

        broker.drop_feed("test").await;
        assert!(matches!(rx.recv().await, Some(FeedMessage::Disconnected(_))));

        broker.set_feed_available(false);
        let (tx, _rx) = mpsc::channel(8);
        assert!(broker.stream_ticks(&[], tx).await.is_err());
        assert_eq!(broker.stream_attempts(), 2);
    }
}
