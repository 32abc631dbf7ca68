//! 统一错误类型定义

pub mod app_error;

pub use app_error::{
    BrokerError, ErrorKind, ExecutionError, SchedulerError, StoreError, StrategyManagerError,
};
