//! 运行时状态存储
//!
//! 内存（DashMap）与 Redis 两种实现，读取均返回快照

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::trading::model::keys::RUNTIME_INDEX_KEY;
use crate::trading::model::{StateUpdate, StrategyDefinition, StrategyKey, StrategyRuntimeState};

pub type StatePredicate<'a> = &'a (dyn Fn(&StrategyRuntimeState) -> bool + Send + Sync);

#[async_trait]
pub trait RuntimeStateStore: Send + Sync {
    /// 写入完整状态（覆盖）
    async fn put(&self, state: &StrategyRuntimeState) -> Result<(), StoreError>;

    async fn get(&self, key: &StrategyKey) -> Result<Option<StrategyRuntimeState>, StoreError>;

    /// 原子合并部分字段，返回合并后的快照
    async fn update(
        &self,
        key: &StrategyKey,
        update: &StateUpdate,
    ) -> Result<StrategyRuntimeState, StoreError>;

    async fn remove(&self, key: &StrategyKey) -> Result<Option<StrategyRuntimeState>, StoreError>;

    async fn list_all(
        &self,
        predicate: StatePredicate<'_>,
    ) -> Result<Vec<StrategyRuntimeState>, StoreError>;
}

/// 内存实现
#[derive(Default)]
pub struct InMemoryRuntimeStateStore {
    states: DashMap<StrategyKey, StrategyRuntimeState>,
}

impl InMemoryRuntimeStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuntimeStateStore for InMemoryRuntimeStateStore {
    async fn put(&self, state: &StrategyRuntimeState) -> Result<(), StoreError> {
        self.states.insert(state.key(), state.clone());
        Ok(())
    }

    async fn get(&self, key: &StrategyKey) -> Result<Option<StrategyRuntimeState>, StoreError> {
        Ok(self.states.get(key).map(|entry| entry.value().clone()))
    }

    async fn update(
        &self,
        key: &StrategyKey,
        update: &StateUpdate,
    ) -> Result<StrategyRuntimeState, StoreError> {
        // 持有分片写锁完成校验与合并
        let mut entry = self
            .states
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        update.apply(entry.value_mut(), Utc::now())?;
        Ok(entry.value().clone())
    }

    async fn remove(&self, key: &StrategyKey) -> Result<Option<StrategyRuntimeState>, StoreError> {
        Ok(self.states.remove(key).map(|(_, state)| state))
    }

    async fn list_all(
        &self,
        predicate: StatePredicate<'_>,
    ) -> Result<Vec<StrategyRuntimeState>, StoreError> {
        Ok(self
            .states
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect())
    }
}

/// 仅当值未被他人修改时写入
static CAS_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
end
return 0
"#,
    )
});

/// Redis 实现：JSON 值 + 索引集合
pub struct RedisRuntimeStateStore {
    conn: MultiplexedConnection,
    max_cas_retries: usize,
}

impl RedisRuntimeStateStore {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            max_cas_retries: 8,
        }
    }

    fn decode(raw: &str) -> Result<StrategyRuntimeState, StoreError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[async_trait]
impl RuntimeStateStore for RedisRuntimeStateStore {
    async fn put(&self, state: &StrategyRuntimeState) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let redis_key = state.key().state_key();
        let payload = serde_json::to_string(state)?;
        let _: () = redis::pipe()
            .atomic()
            .set(&redis_key, payload)
            .ignore()
            .sadd(RUNTIME_INDEX_KEY, &redis_key)
            .ignore()
            .query_async(&mut conn)
            .await?;
        debug!("运行时状态写入 Redis: {}", redis_key);
        Ok(())
    }

    async fn get(&self, key: &StrategyKey) -> Result<Option<StrategyRuntimeState>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key.state_key()).await?;
        raw.as_deref().map(Self::decode).transpose()
    }

    async fn update(
        &self,
        key: &StrategyKey,
        update: &StateUpdate,
    ) -> Result<StrategyRuntimeState, StoreError> {
        let mut conn = self.conn.clone();
        let redis_key = key.state_key();

        for attempt in 1..=self.max_cas_retries {
            let raw: Option<String> = conn.get(&redis_key).await?;
            let raw = raw.ok_or_else(|| StoreError::NotFound(key.clone()))?;
            let mut state = Self::decode(&raw)?;
            update.apply(&mut state, Utc::now())?;
            let payload = serde_json::to_string(&state)?;

            let swapped: i32 = CAS_SCRIPT
                .key(&redis_key)
                .arg(&raw)
                .arg(&payload)
                .invoke_async(&mut conn)
                .await?;
            if swapped == 1 {
                return Ok(state);
            }
            debug!("CAS 冲突，重试 key={} attempt={}", redis_key, attempt);
        }

        warn!("CAS 重试耗尽: {}", redis_key);
        Err(StoreError::Conflict(key.clone()))
    }

    async fn remove(&self, key: &StrategyKey) -> Result<Option<StrategyRuntimeState>, StoreError> {
        let mut conn = self.conn.clone();
        let redis_key = key.state_key();
        let raw: Option<String> = conn.get(&redis_key).await?;
        let _: () = redis::pipe()
            .atomic()
            .del(&redis_key)
            .ignore()
            .srem(RUNTIME_INDEX_KEY, &redis_key)
            .ignore()
            .query_async(&mut conn)
            .await?;
        raw.as_deref().map(Self::decode).transpose()
    }

    async fn list_all(
        &self,
        predicate: StatePredicate<'_>,
    ) -> Result<Vec<StrategyRuntimeState>, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.smembers(RUNTIME_INDEX_KEY).await?;
        let mut states = Vec::with_capacity(keys.len());
        for redis_key in keys {
            let raw: Option<String> = conn.get(&redis_key).await?;
            match raw {
                Some(raw) => match Self::decode(&raw) {
                    Ok(state) if predicate(&state) => states.push(state),
                    Ok(_) => {}
                    Err(e) => warn!("运行时状态解析失败 key={}: {}", redis_key, e),
                },
                None => {
                    // 索引残留
                    let _: () = conn.srem(RUNTIME_INDEX_KEY, &redis_key).await?;
                }
            }
        }
        Ok(states)
    }
}

/// 对账结果：已删除的孤儿条目与需要重新物化的定义
#[derive(Debug, Default)]
pub struct ReconcileDiff {
    pub removed: Vec<StrategyKey>,
    pub missing: Vec<StrategyDefinition>,
}

/// 以 RUNNING 定义为准修复运行时状态漂移
///
/// 没有 RUNNING 定义的运行时条目直接删除；缺少运行时条目的 RUNNING 定义
/// 交给调用方重新物化（需要注册触发器与订阅行情）。
pub async fn reconcile_runtime_states(
    store: &Arc<dyn RuntimeStateStore>,
    running: &[StrategyDefinition],
) -> Result<ReconcileDiff, StoreError> {
    let expected: HashSet<StrategyKey> = running.iter().map(|d| d.key()).collect();
    let present = store.list_all(&|_: &StrategyRuntimeState| true).await?;
    let present_keys: HashSet<StrategyKey> = present.iter().map(|s| s.key()).collect();

    let mut diff = ReconcileDiff::default();
    for state in present {
        let key = state.key();
        if !expected.contains(&key) {
            store.remove(&key).await?;
            info!("对账删除孤儿运行时状态: {}", key);
            diff.removed.push(key);
        }
    }
    diff.missing = running
        .iter()
        .filter(|d| !present_keys.contains(&d.key()))
        .cloned()
        .collect();
    Ok(diff)
}
