//! 策略执行：定时触发、止损监控、下单执行与生命周期管理

pub mod execution_engine;
pub mod retry;
pub mod scheduler;
pub mod stop_loss_monitor;
pub mod strategy_manager;

pub use execution_engine::{
    ExecutionEngine, ExecutionOutcome, ExecutionSettings, LifecycleSignal,
};
pub use scheduler::{SchedulerSettings, StrategyScheduler, TriggerKind};
pub use stop_loss_monitor::StopLossMonitor;
pub use strategy_manager::{EmergencyStopReport, ReconcileReport, StrategyManager};
