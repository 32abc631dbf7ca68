pub mod backoff;
pub mod ingest;
pub mod normalizer;
pub mod subscription;
pub mod tick_channel;

pub use backoff::ReconnectBackoff;
pub use ingest::{FeedHealthListener, FeedTick, MarketDataIngest};
pub use normalizer::normalize_tick;
pub use subscription::SymbolSubscriptions;
pub use tick_channel::{tick_channel, TickReceiver, TickSender};
