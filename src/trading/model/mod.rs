//! 运行时数据模型

pub mod enums;
pub mod event;
pub mod keys;
pub mod market;
pub mod order;
pub mod runtime_state;
pub mod strategy_definition;

pub use enums::{EventType, OrderAction, OrderSide, OrderStatus, PositionState, StrategyStatus};
pub use event::RuntimeEvent;
pub use keys::StrategyKey;
pub use market::{FeedMessage, PriceTick, RawTick};
pub use order::{BrokerHolding, BrokerPosition, BrokerProfile, OrderIntent, OrderResult};
pub use runtime_state::{StateTransitionError, StateUpdate, StrategyRuntimeState};
pub use strategy_definition::StrategyDefinition;
