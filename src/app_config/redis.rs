use anyhow::{anyhow, Result};
use redis::aio::MultiplexedConnection;
use redis::Client;
use tracing::{debug, error, info};

/// Redis连接池管理器
///
/// 多路复用连接本身可克隆共享，这里只在初始化时建立一次。
pub struct RedisConnectionPool {
    conn: MultiplexedConnection,
}

impl RedisConnectionPool {
    /// 创建新的连接池
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client =
            Client::open(redis_url).map_err(|e| anyhow!("Failed to create Redis client: {}", e))?;

        // 测试连接
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!("Redis connection test failed: {}", redis_url);
                anyhow!("Failed to test Redis connection: {}", e)
            })?;

        info!("Redis connection pool initialized successfully ！");
        Ok(Self { conn })
    }

    /// 获取连接
    pub fn get_connection(&self) -> MultiplexedConnection {
        debug!("获取Redis连接");
        self.conn.clone()
    }
}
