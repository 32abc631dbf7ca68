use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app_config::redis::RedisConnectionPool;
use crate::app_config::settings::{RuntimeSettings, StateBackend};
use crate::job::start_reconcile_scheduler;
use crate::time_util::{Clock, SystemClock};
use crate::trading::broker::{BrokerRegistry, BrokerSessions, EnvCredentialProvider};
use crate::trading::cache::{
    InMemoryOrderLock, InMemoryRuntimeStateStore, OrderLock, RedisOrderLock,
    RedisRuntimeStateStore, RuntimeStateStore,
};
use crate::trading::market::{tick_channel, MarketDataIngest};
use crate::trading::services::{
    AuditSink, EventBus, EventMirror, InMemoryAuditSink, InMemoryDefinitionStore, RedisAuditSink,
    RedisEventMirror, StrategyDefinitionStore,
};
use crate::trading::strategy::{
    ExecutionEngine, ExecutionSettings, SchedulerSettings, StopLossMonitor, StrategyManager,
    StrategyScheduler,
};

/// 止损监控同时排队的 symbol 上限
const TICK_QUEUE_CAPACITY: usize = 4096;

/// 共享存储后端
pub struct Backends {
    pub store: Arc<dyn RuntimeStateStore>,
    pub locks: Arc<dyn OrderLock>,
    pub audit: Arc<dyn AuditSink>,
    pub mirror: Option<Arc<dyn EventMirror>>,
}

impl Backends {
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryRuntimeStateStore::new()),
            locks: Arc::new(InMemoryOrderLock::new()),
            audit: Arc::new(InMemoryAuditSink::new()),
            mirror: None,
        }
    }
}

/// 按 STATE_BACKEND 构造存储后端
pub async fn build_backends(settings: &RuntimeSettings) -> anyhow::Result<Backends> {
    match settings.state_backend {
        StateBackend::Memory => {
            info!("使用内存存储后端");
            Ok(Backends::in_memory())
        }
        StateBackend::Redis => {
            let pool = RedisConnectionPool::new(&settings.redis_url).await?;
            let conn = pool.get_connection();
            info!("使用 Redis 存储后端: {}", settings.redis_url);
            Ok(Backends {
                store: Arc::new(RedisRuntimeStateStore::new(conn.clone())),
                locks: Arc::new(RedisOrderLock::new(conn.clone())),
                audit: Arc::new(RedisAuditSink::new(conn.clone())),
                mirror: Some(Arc::new(RedisEventMirror::new(conn))),
            })
        }
    }
}

/// 组装完成的运行时服务
pub struct RuntimeServices {
    pub event_bus: Arc<EventBus>,
    pub sessions: Arc<BrokerSessions>,
    pub engine: Arc<ExecutionEngine>,
    pub scheduler: Arc<StrategyScheduler>,
    pub ingest: Arc<MarketDataIngest>,
    pub monitor: Arc<StopLossMonitor>,
    pub manager: Arc<StrategyManager>,
    tasks: Vec<JoinHandle<()>>,
}

impl RuntimeServices {
    /// 撤销触发器、关闭行情连接并停止后台任务
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        for task in &self.tasks {
            task.abort();
        }
        info!("运行时服务已关闭");
    }
}

/// 组装服务并启动止损监控与生命周期两个后台任务，需在 tokio 运行时内调用
pub fn wire(
    settings: &RuntimeSettings,
    backends: Backends,
    sessions: Arc<BrokerSessions>,
    definitions: Arc<dyn StrategyDefinitionStore>,
    clock: Arc<dyn Clock>,
) -> RuntimeServices {
    let mut event_bus = EventBus::new(settings.event_replay_capacity);
    if let Some(mirror) = backends.mirror {
        event_bus = event_bus.with_mirror(mirror);
    }
    let event_bus = Arc::new(event_bus);

    let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(ExecutionEngine::new(
        backends.store,
        backends.locks,
        sessions.clone(),
        event_bus.clone(),
        backends.audit,
        ExecutionSettings::from_runtime(settings),
        lifecycle_tx,
    ));

    let (tick_tx, tick_rx) = tick_channel(TICK_QUEUE_CAPACITY);
    let ingest = Arc::new(MarketDataIngest::new(
        sessions.clone(),
        settings.feed.clone(),
        event_bus.clone(),
        engine.clone(),
        tick_tx,
    ));

    let scheduler = Arc::new(StrategyScheduler::new(
        engine.clone(),
        SchedulerSettings::from_runtime(settings),
        clock,
    ));
    let monitor = Arc::new(StopLossMonitor::new(engine.clone()));
    let manager = Arc::new(StrategyManager::new(
        definitions,
        engine.clone(),
        scheduler.clone(),
        ingest.clone(),
    ));

    let tasks = vec![
        tokio::spawn(monitor.clone().run(tick_rx)),
        tokio::spawn(manager.clone().run_lifecycle(lifecycle_rx)),
    ];

    RuntimeServices {
        event_bus,
        sessions,
        engine,
        scheduler,
        ingest,
        monitor,
        manager,
        tasks,
    }
}

/// 命令行参数
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub start: Vec<String>,
    pub definitions: Option<String>,
}

/// 应用入口：组装服务、启动对账与策略、等待退出信号后优雅关闭
pub async fn run(options: RunOptions) -> anyhow::Result<()> {
    let settings = RuntimeSettings::from_env()?;
    info!(
        "运行时配置 env={} backend={:?} window={}-{}",
        settings.app_env,
        settings.state_backend,
        settings.trading_window.start,
        settings.trading_window.end
    );

    let definitions: Arc<dyn StrategyDefinitionStore> =
        match options.definitions.clone().or(settings.definitions_path.clone()) {
            Some(path) => Arc::new(InMemoryDefinitionStore::from_json_file(&path)?),
            None => {
                warn!("未配置 STRATEGY_DEFINITIONS_PATH，策略定义为空");
                Arc::new(InMemoryDefinitionStore::new())
            }
        };

    let backends = build_backends(&settings).await?;
    let sessions = Arc::new(BrokerSessions::new(
        BrokerRegistry::with_defaults(),
        Arc::new(EnvCredentialProvider),
    ));
    let services = wire(&settings, backends, sessions, definitions, Arc::new(SystemClock));

    // 启动时对账，接管上次进程遗留的运行时状态
    match services.manager.reconcile().await {
        Ok(report) => info!(
            "启动对账 removed={} rematerialized={} errored={} failed={}",
            report.removed.len(),
            report.rematerialized.len(),
            report.errored.len(),
            report.failed.len()
        ),
        Err(e) => error!("启动对账失败: {}", e),
    }

    for strategy_id in &options.start {
        match services.manager.start_strategy(strategy_id).await {
            Ok(state) => info!("启动策略成功: {} symbol={}", strategy_id, state.symbol),
            Err(e) => error!("启动策略失败: 策略ID={}, 错误: {}", strategy_id, e),
        }
    }

    let mut cron = start_reconcile_scheduler(services.manager.clone(), &settings.reconcile_cron).await?;

    let signal_name = setup_shutdown_signals().await?;
    info!("接收到 {} 信号，开始优雅关闭...", signal_name);

    services.shutdown().await;
    if let Err(e) = cron.shutdown().await {
        error!("任务调度器关闭失败: {}", e);
    }
    info!("应用已优雅退出");
    Ok(())
}

/// 设置多种退出信号处理
async fn setup_shutdown_signals() -> anyhow::Result<&'static str> {
    use tokio::signal;

    #[cfg(unix)]
    {
        let register = |kind| {
            signal::unix::signal(kind).map_err(|e| anyhow!("注册信号处理失败: {}", e))
        };
        let mut sigterm = register(signal::unix::SignalKind::terminate())?;
        let mut sigint = register(signal::unix::SignalKind::interrupt())?;
        let mut sigquit = register(signal::unix::SignalKind::quit())?;

        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = sigquit.recv() => "SIGQUIT",
        };
        Ok(name)
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .map_err(|e| anyhow!("监听 ctrl-c 失败: {}", e))?;
        Ok("CTRL+C")
    }
}
