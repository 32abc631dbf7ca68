#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeZone, Utc};

use strategy_runtime::app::bootstrap::{wire, Backends, RuntimeServices};
use strategy_runtime::app_config::settings::{
    FeedSettings, RetrySettings, RuntimeSettings, StateBackend,
};
use strategy_runtime::time_util::{
    venue_offset, TokioClock, TradingWindow, DEFAULT_VENUE_UTC_OFFSET_MINUTES,
};
use strategy_runtime::trading::broker::{
    BrokerRegistry, BrokerSessions, PaperBroker, StaticCredentialProvider,
};
use strategy_runtime::trading::cache::{
    InMemoryOrderLock, InMemoryRuntimeStateStore, RuntimeStateStore,
};
use strategy_runtime::trading::model::{
    OrderAction, StrategyDefinition, StrategyKey, StrategyRuntimeState, StrategyStatus,
};
use strategy_runtime::trading::services::{InMemoryAuditSink, InMemoryDefinitionStore};

pub const USER: &str = "u1";
pub const SYMBOL: &str = "RELIANCE";
pub const BROKER: &str = "paper";

/// 2024-01-10（周三）09:10 IST
pub fn before_buy_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 10, 3, 40, 0).unwrap()
}

pub fn test_settings() -> RuntimeSettings {
    RuntimeSettings {
        app_env: "LOCAL".to_string(),
        state_backend: StateBackend::Memory,
        redis_url: String::new(),
        venue_offset: venue_offset(DEFAULT_VENUE_UTC_OFFSET_MINUTES).unwrap(),
        trading_window: TradingWindow::default(),
        misfire_grace: Duration::from_secs(60),
        order_lock_ttl: Duration::from_secs(30),
        broker_call_timeout: Duration::from_secs(5),
        order_fill_timeout: Duration::from_millis(300),
        order_fill_poll: Duration::from_millis(20),
        retry: RetrySettings {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
        execution_workers: 8,
        feed: FeedSettings {
            reconnect_max_attempts: 2,
            reconnect_base: Duration::from_millis(100),
            reconnect_max: Duration::from_millis(400),
            slow_retry: Duration::from_secs(5),
        },
        event_replay_capacity: 256,
        reconcile_cron: "0 */5 * * * *".to_string(),
        definitions_path: None,
    }
}

/// 09:20 买入、15:10 卖出
pub fn definition(strategy_id: &str, user_id: &str, stop_loss: f64) -> StrategyDefinition {
    StrategyDefinition {
        strategy_id: strategy_id.to_string(),
        user_id: user_id.to_string(),
        name: None,
        symbol: SYMBOL.to_string(),
        buy_time: NaiveTime::from_hms_opt(9, 20, 0).unwrap(),
        sell_time: NaiveTime::from_hms_opt(15, 10, 0).unwrap(),
        stop_loss,
        quantity: 10,
        broker: BROKER.to_string(),
        status: StrategyStatus::Created,
    }
}

/// 内存后端 + 模拟券商组装的完整运行时
pub struct Harness {
    pub paper: Arc<PaperBroker>,
    pub definitions: Arc<InMemoryDefinitionStore>,
    pub store: Arc<InMemoryRuntimeStateStore>,
    pub locks: Arc<InMemoryOrderLock>,
    pub audit: Arc<InMemoryAuditSink>,
    pub services: RuntimeServices,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    pub fn with_settings(settings: RuntimeSettings) -> Self {
        let paper = Arc::new(PaperBroker::new());
        let mut registry = BrokerRegistry::new();
        registry.register_shared(BROKER, paper.clone());
        let sessions = Arc::new(BrokerSessions::new(
            registry,
            Arc::new(StaticCredentialProvider::permissive()),
        ));

        let definitions = Arc::new(InMemoryDefinitionStore::new());
        let store = Arc::new(InMemoryRuntimeStateStore::new());
        let locks = Arc::new(InMemoryOrderLock::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let backends = Backends {
            store: store.clone(),
            locks: locks.clone(),
            audit: audit.clone(),
            mirror: None,
        };
        let services = wire(
            &settings,
            backends,
            sessions,
            definitions.clone(),
            Arc::new(TokioClock::starting_at(before_buy_time())),
        );

        Self {
            paper,
            definitions,
            store,
            locks,
            audit,
            services,
        }
    }

    /// 经由策略管理器启动（订阅行情 + 注册触发器），并等待行情连上
    pub async fn start(&self, definition: StrategyDefinition) -> StrategyKey {
        let key = definition.key();
        let strategy_id = definition.strategy_id.clone();
        self.definitions.insert(definition);
        self.services
            .manager
            .start_strategy(&strategy_id)
            .await
            .unwrap();
        let ingest = self.services.ingest.clone();
        let user_id = key.user_id.clone();
        assert!(
            eventually(|| {
                let ingest = ingest.clone();
                let user_id = user_id.clone();
                async move { ingest.is_connected(&user_id, BROKER).await }
            })
            .await,
            "行情未连接"
        );
        key
    }

    /// 只物化运行时状态，不订阅行情也不注册触发器
    pub async fn activate(&self, definition: StrategyDefinition) -> StrategyKey {
        let key = definition.key();
        self.services.engine.activate(&definition).await.unwrap();
        key
    }

    /// 以指定价格买入
    pub async fn buy_at(&self, key: &StrategyKey, price: f64) {
        self.paper.set_price(SYMBOL, price).await;
        self.services
            .engine
            .execute(key, OrderAction::Buy)
            .await
            .unwrap();
    }

    pub async fn state(&self, key: &StrategyKey) -> Option<StrategyRuntimeState> {
        self.store.get(key).await.unwrap()
    }
}

/// 轮询直到条件成立，最多约 2 秒
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
