use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::trading::model::{StateTransitionError, StrategyKey};

/// 券商调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    /// 网络抖动、5xx 等，可重试
    #[error("券商暂时不可用: {0}")]
    Transient(String),

    /// 券商校验类拒单，不重试
    #[error("券商拒单: {0}")]
    Rejected(String),

    #[error("券商未连接: {0}")]
    NotConnected(String),

    #[error("行情连接断开: {0}")]
    Disconnected(String),

    #[error("券商调用超时: {0:?}")]
    Timeout(Duration),

    #[error("未知券商: {0}")]
    UnknownBroker(String),

    #[error("券商凭证缺失: {0}")]
    MissingCredentials(String),
}

impl BrokerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Transient(_) | BrokerError::Timeout(_))
    }
}

/// 运行时状态存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("运行时状态不存在: {0}")]
    NotFound(StrategyKey),

    #[error(transparent)]
    Transition(#[from] StateTransitionError),

    #[error("并发更新冲突: {0}")]
    Conflict(StrategyKey),

    #[error("Redis错误: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("序列化错误: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("存储后端错误: {0}")]
    Backend(#[from] anyhow::Error),
}

/// 错误类别，写入审计记录与 ERROR 事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    DuplicateOrder,
    BrokerError,
    FeedDisconnected,
    ExecutionFailure,
    StoreError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "Validation",
            ErrorKind::DuplicateOrder => "DuplicateOrder",
            ErrorKind::BrokerError => "BrokerError",
            ErrorKind::FeedDisconnected => "FeedDisconnected",
            ErrorKind::ExecutionFailure => "ExecutionFailure",
            ErrorKind::StoreError => "StoreError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 执行引擎错误
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("前置条件不满足: {0}")]
    Validation(String),

    #[error("重复下单，锁已被占用: {lock_key}")]
    DuplicateOrder { lock_key: String },

    #[error("券商调用失败: {0}")]
    Broker(#[from] BrokerError),

    #[error("行情连接断开: {0}")]
    FeedDisconnected(String),

    #[error("重试耗尽，需人工介入: attempts={attempts}, last_error={last_error}")]
    ExecutionFailure { attempts: usize, last_error: String },

    #[error("订单未在 {waited:?} 内成交，需人工核对: order_id={broker_order_id}")]
    FillTimeout {
        broker_order_id: String,
        waited: Duration,
    },

    #[error("存储错误: {0}")]
    Store(String),
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::Validation(_) => ErrorKind::Validation,
            ExecutionError::DuplicateOrder { .. } => ErrorKind::DuplicateOrder,
            ExecutionError::Broker(_) => ErrorKind::BrokerError,
            ExecutionError::FeedDisconnected(_) => ErrorKind::FeedDisconnected,
            ExecutionError::ExecutionFailure { .. } | ExecutionError::FillTimeout { .. } => {
                ErrorKind::ExecutionFailure
            }
            ExecutionError::Store(_) => ErrorKind::StoreError,
        }
    }
}

impl From<StoreError> for ExecutionError {
    fn from(e: StoreError) -> Self {
        ExecutionError::Store(e.to_string())
    }
}

/// 调度器错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("触发时间不在交易时段内: {time} (窗口 {start}-{end})")]
    OutsideTradingWindow {
        time: chrono::NaiveTime,
        start: chrono::NaiveTime,
        end: chrono::NaiveTime,
    },

    #[error("找不到下一个交易日触发时间: {0}")]
    NoUpcomingOccurrence(chrono::NaiveTime),
}

/// 策略管理器错误
#[derive(Error, Debug)]
pub enum StrategyManagerError {
    #[error("策略配置不存在: {strategy_id}")]
    DefinitionNotFound { strategy_id: String },

    #[error("策略配置非法: {strategy_id}, {reason}")]
    InvalidDefinition { strategy_id: String, reason: String },

    #[error("策略已在运行: {strategy_id}")]
    AlreadyRunning { strategy_id: String },

    #[error("策略未运行: {strategy_id}")]
    NotRunning { strategy_id: String },

    #[error("策略处于 ERROR，需先停止: {strategy_id}")]
    InError { strategy_id: String },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("策略配置存储错误: {0}")]
    Definitions(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_retryable() {
        assert!(BrokerError::Transient("503".into()).is_retryable());
        assert!(BrokerError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(!BrokerError::Rejected("bad qty".into()).is_retryable());
        assert!(!BrokerError::NotConnected("dhan".into()).is_retryable());
    }

    #[test]
    fn test_execution_error_kind() {
        let err = ExecutionError::DuplicateOrder {
            lock_key: "lock:order:s1:BUY".into(),
        };
        assert_eq!(err.kind(), ErrorKind::DuplicateOrder);
        let err: ExecutionError = BrokerError::Rejected("x".into()).into();
        assert_eq!(err.kind().as_str(), "BrokerError");
        let err: ExecutionError = StoreError::NotFound(StrategyKey::new("u", "s")).into();
        assert_eq!(err.kind(), ErrorKind::StoreError);
        let err = ExecutionError::FillTimeout {
            broker_order_id: "PAPER-1".into(),
            waited: Duration::from_secs(10),
        };
        assert_eq!(err.kind(), ErrorKind::ExecutionFailure);
    }
}
