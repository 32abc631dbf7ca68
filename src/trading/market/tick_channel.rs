//! 行情到止损监控的投递通道
//!
//! 同一 (user, broker, symbol) 只保留最新一条，监控来不及处理时旧价直接被覆盖。
//! 排队的只是 key，数量以订阅的 symbol 数为上限，发送端从不等待。

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use super::ingest::FeedTick;

/// (user_id, broker, symbol)
pub type TickKey = (String, String, String);

fn tick_key(tick: &FeedTick) -> TickKey {
    (
        tick.user_id.clone(),
        tick.broker.clone(),
        tick.tick.symbol.clone(),
    )
}

/// 创建一对收发端，`capacity` 为可同时排队的 symbol 数
pub fn tick_channel(capacity: usize) -> (TickSender, TickReceiver) {
    let latest = Arc::new(DashMap::new());
    let (ready_tx, ready_rx) = mpsc::channel(capacity.max(1));
    (
        TickSender {
            latest: latest.clone(),
            ready: ready_tx,
        },
        TickReceiver {
            latest,
            ready: ready_rx,
        },
    )
}

#[derive(Clone)]
pub struct TickSender {
    latest: Arc<DashMap<TickKey, FeedTick>>,
    ready: mpsc::Sender<TickKey>,
}

impl TickSender {
    /// 写入最新价；接收端已关闭时返回 false
    pub fn send(&self, tick: FeedTick) -> bool {
        if self.ready.is_closed() {
            return false;
        }
        let key = tick_key(&tick);
        let symbol = key.2.clone();
        if self.latest.insert(key.clone(), tick).is_some() {
            // 已在排队，接收端会取到这条最新价
            return true;
        }
        match self.ready.try_send(key) {
            Ok(()) => true,
            Err(TrySendError::Full(key)) => {
                self.latest.remove(&key);
                warn!("止损行情队列已满，丢弃 symbol={}", symbol);
                true
            }
            Err(TrySendError::Closed(key)) => {
                self.latest.remove(&key);
                false
            }
        }
    }
}

pub struct TickReceiver {
    latest: Arc<DashMap<TickKey, FeedTick>>,
    ready: mpsc::Receiver<TickKey>,
}

impl TickReceiver {
    /// 下一条待处理行情；所有发送端关闭后返回 None
    pub async fn recv(&mut self) -> Option<FeedTick> {
        loop {
            let key = self.ready.recv().await?;
            if let Some((_, tick)) = self.latest.remove(&key) {
                return Some(tick);
            }
        }
    }

    /// 尚未被取走的行情条数
    pub fn pending(&self) -> usize {
        self.latest.len()
    }
}
