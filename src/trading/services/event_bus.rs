//! 按用户分发的事件总线
//!
//! 每个用户一个广播通道与两份有界环形缓冲（用于断线重放）：
//! 订单与生命周期事件一份，高频的 PRICE_UPDATE 单独一份小缓冲，行情再多也挤不掉订单事件。
//! 序号按用户单调递增；订阅端按序号去重，重放与实时之间不丢不重。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use dashmap::DashMap;
use futures::Stream;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, warn};

use crate::trading::model::keys::event_channel_key;
use crate::trading::model::{EventType, RuntimeEvent};

/// 进程外转发（如 Redis pub/sub），不得阻塞发布方
pub trait EventMirror: Send + Sync {
    fn mirror(&self, event: &RuntimeEvent);
}

/// 行情缓冲相对主缓冲的比例
const PRICE_RING_DIVISOR: usize = 8;

struct UserChannel {
    next_seq: u64,
    ring: VecDeque<RuntimeEvent>,
    price_ring: VecDeque<RuntimeEvent>,
    sender: broadcast::Sender<RuntimeEvent>,
}

impl UserChannel {
    /// 两份缓冲中 sequence_id > after 的事件，按序号排列
    fn replay_after(&self, after: u64) -> VecDeque<RuntimeEvent> {
        let mut events: Vec<RuntimeEvent> = self
            .ring
            .iter()
            .chain(self.price_ring.iter())
            .filter(|e| e.sequence_id > after)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.sequence_id);
        events.into()
    }
}

fn push_bounded(ring: &mut VecDeque<RuntimeEvent>, capacity: usize, event: RuntimeEvent) {
    if ring.len() >= capacity {
        ring.pop_front();
    }
    ring.push_back(event);
}

fn lock_channel(channel: &Mutex<UserChannel>) -> MutexGuard<'_, UserChannel> {
    channel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct EventBus {
    channels: DashMap<String, Arc<Mutex<UserChannel>>>,
    capacity: usize,
    price_capacity: usize,
    mirror: Option<Arc<dyn EventMirror>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            channels: DashMap::new(),
            capacity,
            price_capacity: (capacity / PRICE_RING_DIVISOR).max(1),
            mirror: None,
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn EventMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    fn channel(&self, user_id: &str) -> Arc<Mutex<UserChannel>> {
        self.channels
            .entry(user_id.to_string())
            .or_insert_with(|| {
                let (sender, _) = broadcast::channel(self.capacity);
                Arc::new(Mutex::new(UserChannel {
                    next_seq: 0,
                    ring: VecDeque::with_capacity(self.capacity),
                    price_ring: VecDeque::with_capacity(self.price_capacity),
                    sender,
                }))
            })
            .clone()
    }

    /// 分配序号、写入环形缓冲并广播，返回发布的事件
    pub fn publish(
        &self,
        user_id: &str,
        event_type: EventType,
        strategy_id: Option<&str>,
        payload: Value,
    ) -> RuntimeEvent {
        let channel = self.channel(user_id);
        let event = {
            let mut channel = lock_channel(&channel);
            channel.next_seq += 1;
            let event = RuntimeEvent {
                event_type,
                user_id: user_id.to_string(),
                strategy_id: strategy_id.map(str::to_string),
                payload,
                sequence_id: channel.next_seq,
                occurred_at: Utc::now(),
            };
            if event_type == EventType::PriceUpdate {
                push_bounded(&mut channel.price_ring, self.price_capacity, event.clone());
            } else {
                push_bounded(&mut channel.ring, self.capacity, event.clone());
            }
            // 没有订阅者时发送失败，忽略
            let _ = channel.sender.send(event.clone());
            event
        };

        if let Some(mirror) = &self.mirror {
            mirror.mirror(&event);
        }
        if event_type != EventType::PriceUpdate {
            debug!(
                "事件发布 user_id={} type={} seq={}",
                user_id,
                event_type.as_str(),
                event.sequence_id
            );
        }
        event
    }

    /// 订阅：先重放 sequence_id > last_seen 的缓冲事件，再接实时事件
    pub fn subscribe(&self, user_id: &str, last_seen: Option<u64>) -> EventSubscription {
        let channel = self.channel(user_id);
        let last_delivered = last_seen.unwrap_or(0);
        let (receiver, backlog) = {
            let guard = lock_channel(&channel);
            (guard.sender.subscribe(), guard.replay_after(last_delivered))
        };
        EventSubscription {
            channel,
            receiver,
            backlog,
            last_delivered,
        }
    }

    /// 当前缓冲中的事件快照，按序号排列
    pub fn recent(&self, user_id: &str) -> Vec<RuntimeEvent> {
        match self.channels.get(user_id) {
            Some(channel) => lock_channel(channel.value()).replay_after(0).into(),
            None => Vec::new(),
        }
    }
}

/// 单个订阅连接
pub struct EventSubscription {
    channel: Arc<Mutex<UserChannel>>,
    receiver: broadcast::Receiver<RuntimeEvent>,
    backlog: VecDeque<RuntimeEvent>,
    last_delivered: u64,
}

impl EventSubscription {
    /// 按序号递增返回下一个事件
    pub async fn next(&mut self) -> Option<RuntimeEvent> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                if event.sequence_id > self.last_delivered {
                    self.last_delivered = event.sequence_id;
                    return Some(event);
                }
                continue;
            }

            match self.receiver.recv().await {
                Ok(event) => {
                    if event.sequence_id > self.last_delivered {
                        self.last_delivered = event.sequence_id;
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("事件订阅落后 {} 条，从缓冲区补齐", skipped);
                    self.backlog = lock_channel(&self.channel).replay_after(self.last_delivered);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn last_delivered(&self) -> u64 {
        self.last_delivered
    }

    pub fn into_stream(self) -> impl Stream<Item = RuntimeEvent> {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|event| (event, subscription))
        })
    }
}

/// 把事件 JSON 发布到 Redis 频道 `events:{user_id}`
pub struct RedisEventMirror {
    conn: MultiplexedConnection,
}

impl RedisEventMirror {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

impl EventMirror for RedisEventMirror {
    fn mirror(&self, event: &RuntimeEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("事件序列化失败: {}", e);
                return;
            }
        };
        let channel = event_channel_key(&event.user_id);
        let mut conn = self.conn.clone();
        tokio::spawn(async move {
            let result: redis::RedisResult<i64> = conn.publish(&channel, payload).await;
            if let Err(e) = result {
                warn!("事件转发 Redis 失败 channel={}: {}", channel, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sequence_is_per_user() {
        let bus = EventBus::new(8);
        let a1 = bus.publish("a", EventType::StrategyStarted, Some("s1"), json!({}));
        let b1 = bus.publish("b", EventType::StrategyStarted, Some("s2"), json!({}));
        let a2 = bus.publish("a", EventType::StrategyStopped, Some("s1"), json!({}));
        assert_eq!((a1.sequence_id, a2.sequence_id, b1.sequence_id), (1, 2, 1));
    }

    #[tokio::test]
    async fn test_ring_is_bounded() {
        let bus = EventBus::new(3);
        for _ in 0..5 {
            bus.publish("a", EventType::OrderExecuted, Some("s1"), json!({}));
        }
        let seqs: Vec<u64> = bus.recent("a").iter().map(|e| e.sequence_id).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert!(bus.recent("nobody").is_empty());
    }

    #[tokio::test]
    async fn test_price_updates_use_their_own_ring() {
        let bus = EventBus::new(16);
        bus.publish("a", EventType::OrderExecuted, Some("s1"), json!({}));
        for _ in 0..40 {
            bus.publish("a", EventType::PriceUpdate, None, json!({}));
        }
        bus.publish("a", EventType::StrategyCompleted, Some("s1"), json!({}));

        let recent = bus.recent("a");
        // 16 / 8 = 2 条行情
        let seqs: Vec<u64> = recent.iter().map(|e| e.sequence_id).collect();
        assert_eq!(seqs, vec![1, 40, 41, 42]);
        assert_eq!(recent[0].event_type, EventType::OrderExecuted);
        assert_eq!(recent[3].event_type, EventType::StrategyCompleted);
    }
}
