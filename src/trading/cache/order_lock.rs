//! 下单互斥锁
//!
//! 单次尝试、不等待；持有者崩溃后依赖 TTL 自愈

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use redis::aio::MultiplexedConnection;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// 持有者令牌
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        LockToken(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// 锁已过期或已被他人重新获取
    AlreadyExpired,
}

#[async_trait]
pub trait OrderLock: Send + Sync {
    /// 获取失败返回 None，调用方不得等待重试
    async fn try_acquire(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<LockToken>>;

    async fn release(&self, key: &str, token: &LockToken) -> anyhow::Result<ReleaseOutcome>;
}

struct HeldLock {
    token: LockToken,
    expires_at: Instant,
}

/// 内存实现，过期时间基于 tokio 时钟
#[derive(Default)]
pub struct InMemoryOrderLock {
    locks: DashMap<String, HeldLock>,
}

impl InMemoryOrderLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderLock for InMemoryOrderLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<LockToken>> {
        let now = Instant::now();
        let token = LockToken::generate();
        let held = HeldLock {
            token: token.clone(),
            expires_at: now + ttl,
        };
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().expires_at <= now {
                    debug!("锁已过期，重新获取: {}", key);
                    entry.insert(held);
                    Ok(Some(token))
                } else {
                    Ok(None)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(held);
                Ok(Some(token))
            }
        }
    }

    async fn release(&self, key: &str, token: &LockToken) -> anyhow::Result<ReleaseOutcome> {
        let now = Instant::now();
        let removed = self
            .locks
            .remove_if(key, |_, held| held.token == *token && held.expires_at > now);
        if removed.is_some() {
            return Ok(ReleaseOutcome::Released);
        }
        // 自己的过期锁顺手清理
        self.locks.remove_if(key, |_, held| held.token == *token);
        Ok(ReleaseOutcome::AlreadyExpired)
    }
}

/// 仅删除自己持有的锁
static RELEASE_SCRIPT: Lazy<redis::Script> = Lazy::new(|| {
    redis::Script::new(
        r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#,
    )
});

/// Redis 实现：SET NX PX + 比较删除
pub struct RedisOrderLock {
    conn: MultiplexedConnection,
}

impl RedisOrderLock {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl OrderLock for RedisOrderLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> anyhow::Result<Option<LockToken>> {
        let mut conn = self.conn.clone();
        let token = LockToken::generate();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.map(|_| token))
    }

    async fn release(&self, key: &str, token: &LockToken) -> anyhow::Result<ReleaseOutcome> {
        let mut conn = self.conn.clone();
        let deleted: i32 = RELEASE_SCRIPT
            .key(key)
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(if deleted == 1 {
            ReleaseOutcome::Released
        } else {
            ReleaseOutcome::AlreadyExpired
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_second_acquire_is_refused_until_expiry() {
        let lock = InMemoryOrderLock::new();
        let ttl = Duration::from_secs(30);
        let token = lock.try_acquire("lock:order:s1:BUY", ttl).await.unwrap();
        assert!(token.is_some());
        assert!(lock.try_acquire("lock:order:s1:BUY", ttl).await.unwrap().is_none());
        assert!(lock.try_acquire("lock:order:s1:SELL", ttl).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(31)).await;
        let stolen = lock.try_acquire("lock:order:s1:BUY", ttl).await.unwrap();
        assert!(stolen.is_some());

        // 原持有者释放时锁已属于他人
        let outcome = lock
            .release("lock:order:s1:BUY", &token.unwrap())
            .await
            .unwrap();
        assert_eq!(outcome, ReleaseOutcome::AlreadyExpired);
        assert!(lock.try_acquire("lock:order:s1:BUY", ttl).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_frees_key() {
        let lock = InMemoryOrderLock::new();
        let ttl = Duration::from_secs(30);
        let token = lock.try_acquire("k", ttl).await.unwrap().unwrap();
        assert_eq!(lock.release("k", &token).await.unwrap(), ReleaseOutcome::Released);
        assert!(lock.try_acquire("k", ttl).await.unwrap().is_some());
    }
}
