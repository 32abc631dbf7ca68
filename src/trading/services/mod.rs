pub mod audit_service;
pub mod definition_store;
pub mod event_bus;

pub use audit_service::{AuditOutcome, AuditRecord, AuditSink, InMemoryAuditSink, RedisAuditSink};
pub use definition_store::{InMemoryDefinitionStore, StrategyDefinitionStore};
pub use event_bus::{EventBus, EventMirror, EventSubscription, RedisEventMirror};
