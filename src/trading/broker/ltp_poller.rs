//! 按间隔轮询 LTP 的简易行情推送
//!
//! 没有 websocket 行情的 REST 适配器共用，订阅集合可在运行中增减。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::error::BrokerError;
use crate::trading::model::{FeedMessage, RawTick};

/// 连续轮询失败次数达到后视为断线
pub const MAX_POLL_FAILURES: u32 = 3;

#[async_trait]
pub trait LtpSource: Send + Sync + 'static {
    /// symbol -> 最新价，缺失的 symbol 不返回
    async fn last_prices(&self, symbols: &[String]) -> Result<HashMap<String, f64>, BrokerError>;
}

pub struct LtpPoller {
    broker: &'static str,
    interval: Duration,
    subscribed: Arc<Mutex<HashSet<String>>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LtpPoller {
    pub fn new(broker: &'static str, interval: Duration) -> Self {
        Self {
            broker,
            interval,
            subscribed: Arc::new(Mutex::new(HashSet::new())),
            task: std::sync::Mutex::new(None),
        }
    }

    /// 替换订阅集合并（重新）启动轮询任务
    pub async fn start(
        &self,
        source: Arc<dyn LtpSource>,
        symbols: &[String],
        sink: mpsc::Sender<FeedMessage>,
    ) {
        {
            let mut subscribed = self.subscribed.lock().await;
            subscribed.clear();
            subscribed.extend(symbols.iter().cloned());
        }

        let broker = self.broker;
        let interval = self.interval;
        let subscribed = Arc::clone(&self.subscribed);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut failures = 0u32;
            loop {
                ticker.tick().await;
                let symbols: Vec<String> = subscribed.lock().await.iter().cloned().collect();
                if symbols.is_empty() {
                    continue;
                }
                match source.last_prices(&symbols).await {
                    Ok(prices) => {
                        failures = 0;
                        let observed = Utc::now().timestamp_millis();
                        for (symbol, price) in prices {
                            let raw = RawTick::new(json!({
                                "symbol": symbol,
                                "ltp": price,
                                "timestamp": observed,
                            }));
                            if sink.send(FeedMessage::Tick(raw)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(
                            "{} 行情轮询失败 ({}/{}): {}",
                            broker, failures, MAX_POLL_FAILURES, e
                        );
                        if failures >= MAX_POLL_FAILURES {
                            error!("{} 行情连接断开", broker);
                            if sink
                                .send(FeedMessage::Disconnected(e.to_string()))
                                .await
                                .is_err()
                            {
                                warn!("{} 断线通知未送达，接收端已关闭", broker);
                            }
                            return;
                        }
                    }
                }
            }
        });
        self.replace_task(Some(handle));
    }

    pub async fn subscribe(&self, symbols: &[String]) {
        self.subscribed.lock().await.extend(symbols.iter().cloned());
    }

    pub async fn unsubscribe(&self, symbols: &[String]) {
        let mut subscribed = self.subscribed.lock().await;
        for symbol in symbols {
            subscribed.remove(symbol);
        }
    }

    fn replace_task(&self, handle: Option<JoinHandle<()>>) {
        if let Ok(mut guard) = self.task.lock() {
            if let Some(previous) = guard.take() {
                previous.abort();
            }
            *guard = handle;
        }
    }
}

impl Drop for LtpPoller {
    fn drop(&mut self) {
        self.replace_task(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::market::normalizer::normalize_tick;
    use approx::assert_relative_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 前 `healthy` 次返回递增价格，之后一直失败
    struct ScriptedSource {
        calls: AtomicUsize,
        healthy: usize,
    }

    #[async_trait]
    impl LtpSource for ScriptedSource {
        async fn last_prices(
            &self,
            symbols: &[String],
        ) -> Result<HashMap<String, f64>, BrokerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call >= self.healthy {
                return Err(BrokerError::Transient("503".into()));
            }
            Ok(symbols
                .iter()
                .map(|s| (s.clone(), 100.0 + call as f64))
                .collect())
        }
    }

    async fn next(rx: &mut mpsc::Receiver<FeedMessage>) -> FeedMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_ticks_then_disconnect() {
        let poller = LtpPoller::new("test", Duration::from_millis(5));
        let source = Arc::new(ScriptedSource {
            calls: AtomicUsize::new(0),
            healthy: 2,
        });
        let (tx, mut rx) = mpsc::channel(16);
        poller.start(source.clone(), &["RELIANCE".to_string()], tx).await;

        for expected in [100.0, 101.0] {
            match next(&mut rx).await {
                FeedMessage::Tick(raw) => {
                    let tick = normalize_tick(&raw).unwrap();
                    assert_eq!(tick.symbol, "RELIANCE");
                    assert_relative_eq!(tick.last_traded_price, expected);
                }
                other => panic!("unexpected message: {:?}", other),
            }
        }
        assert!(matches!(next(&mut rx).await, FeedMessage::Disconnected(_)));
        assert_eq!(
            source.calls.load(Ordering::SeqCst),
            2 + MAX_POLL_FAILURES as usize
        );
    }

    #[tokio::test]
    async fn test_subscription_changes_are_picked_up() {
        let poller = LtpPoller::new("test", Duration::from_millis(5));
        let source = Arc::new(ScriptedSource {
            calls: AtomicUsize::new(0),
            healthy: usize::MAX,
        });
        let (tx, mut rx) = mpsc::channel(1024);
        poller.start(source, &[], tx).await;

        poller.subscribe(&["TCS".to_string()]).await;
        match next(&mut rx).await {
            FeedMessage::Tick(raw) => assert_eq!(normalize_tick(&raw).unwrap().symbol, "TCS"),
            other => panic!("unexpected message: {:?}", other),
        }

        poller.unsubscribe(&["TCS".to_string()]).await;
        // 退订前已取到的一轮仍可能送达
        tokio::time::sleep(Duration::from_millis(20)).await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
