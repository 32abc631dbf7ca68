pub mod order_lock;
pub mod runtime_state_store;

pub use order_lock::{InMemoryOrderLock, LockToken, OrderLock, RedisOrderLock, ReleaseOutcome};
pub use runtime_state_store::{
    reconcile_runtime_states, InMemoryRuntimeStateStore, ReconcileDiff, RedisRuntimeStateStore,
    RuntimeStateStore,
};
