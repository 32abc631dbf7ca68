use std::time::Duration;

use chrono::FixedOffset;

use crate::app_config::env::{env_or_default, env_parse};
use crate::time_util::{self, TradingWindow, DEFAULT_VENUE_UTC_OFFSET_MINUTES};

/// 运行时状态与锁的存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateBackend {
    Memory,
    Redis,
}

impl StateBackend {
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(StateBackend::Memory),
            "redis" => Ok(StateBackend::Redis),
            other => Err(anyhow::anyhow!("未知的 STATE_BACKEND: {}", other)),
        }
    }
}

/// 下单重试参数
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(2000),
        }
    }
}

/// 行情重连参数
#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub reconnect_max_attempts: u32,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// 降级后的慢速重试间隔
    pub slow_retry: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            reconnect_max_attempts: 5,
            reconnect_base: Duration::from_millis(500),
            reconnect_max: Duration::from_millis(30_000),
            slow_retry: Duration::from_secs(60),
        }
    }
}

/// 进程级配置，全部来自环境变量
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub app_env: String,
    pub state_backend: StateBackend,
    pub redis_url: String,
    pub venue_offset: FixedOffset,
    pub trading_window: TradingWindow,
    pub misfire_grace: Duration,
    pub order_lock_ttl: Duration,
    pub broker_call_timeout: Duration,
    /// 挂单等待成交的总时长与查询间隔
    pub order_fill_timeout: Duration,
    pub order_fill_poll: Duration,
    pub retry: RetrySettings,
    pub execution_workers: usize,
    pub feed: FeedSettings,
    pub event_replay_capacity: usize,
    pub reconcile_cron: String,
    pub definitions_path: Option<String>,
}

impl RuntimeSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        let venue_offset = time_util::venue_offset(env_parse(
            "VENUE_UTC_OFFSET_MINUTES",
            DEFAULT_VENUE_UTC_OFFSET_MINUTES,
        ))?;
        let trading_window = TradingWindow::new(
            time_util::parse_time_of_day(&env_or_default("TRADING_WINDOW_START", "09:15"))?,
            time_util::parse_time_of_day(&env_or_default("TRADING_WINDOW_END", "15:30"))?,
        )?;
        let definitions_path = std::env::var("STRATEGY_DEFINITIONS_PATH")
            .ok()
            .filter(|p| !p.trim().is_empty());

        Ok(Self {
            app_env: env_or_default("APP_ENV", crate::ENVIRONMENT_LOCAL),
            state_backend: StateBackend::parse(&env_or_default("STATE_BACKEND", "memory"))?,
            redis_url: env_or_default("REDIS_HOST", "redis://127.0.0.1:6379/"),
            venue_offset,
            trading_window,
            misfire_grace: Duration::from_secs(env_parse("TRIGGER_MISFIRE_GRACE_SECS", 60)),
            order_lock_ttl: Duration::from_secs(env_parse("ORDER_LOCK_TTL_SECS", 30)),
            broker_call_timeout: Duration::from_secs(env_parse("BROKER_CALL_TIMEOUT_SECS", 5)),
            order_fill_timeout: Duration::from_secs(env_parse("ORDER_FILL_TIMEOUT_SECS", 10)),
            order_fill_poll: Duration::from_millis(env_parse("ORDER_FILL_POLL_MS", 500)),
            retry: RetrySettings {
                max_attempts: env_parse("ORDER_MAX_ATTEMPTS", 3usize).max(1),
                base_delay: Duration::from_millis(env_parse("ORDER_RETRY_BASE_MS", 200)),
                max_delay: Duration::from_millis(env_parse("ORDER_RETRY_MAX_MS", 2000)),
            },
            execution_workers: env_parse("EXECUTION_WORKERS", 16usize).max(1),
            feed: FeedSettings {
                reconnect_max_attempts: env_parse("FEED_RECONNECT_MAX_ATTEMPTS", 5),
                reconnect_base: Duration::from_millis(env_parse("FEED_RECONNECT_BASE_MS", 500)),
                reconnect_max: Duration::from_millis(env_parse("FEED_RECONNECT_MAX_MS", 30_000)),
                slow_retry: Duration::from_secs(env_parse("FEED_SLOW_RETRY_SECS", 60)),
            },
            event_replay_capacity: env_parse("EVENT_REPLAY_CAPACITY", 512usize).max(1),
            reconcile_cron: env_or_default("RECONCILE_CRON", "0 */5 * * * *"),
            definitions_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_backend_parse() {
        assert_eq!(StateBackend::parse("Redis").unwrap(), StateBackend::Redis);
        assert_eq!(StateBackend::parse(" memory ").unwrap(), StateBackend::Memory);
        assert!(StateBackend::parse("postgres").is_err());
    }

    #[test]
    fn test_defaults_without_env() {
        let settings = RuntimeSettings::from_env().unwrap();
        assert_eq!(settings.venue_offset.local_minus_utc() % 60, 0);
        assert!(settings.retry.max_attempts >= 1);
        assert!(settings.execution_workers >= 1);
        assert!(settings.trading_window.start < settings.trading_window.end);
    }
}
