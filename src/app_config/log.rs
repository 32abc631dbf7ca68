use std::sync::OnceLock;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, FmtSubscriber, Layer, Registry};

use crate::app_config::env::{env_is_true, env_or_default};
use crate::ENVIRONMENT_LOCAL;

// 全局变量用于保持日志文件句柄
static INFO_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static ERROR_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

const LOG_DIR: &str = "log_files";

/// 默认过滤级别，RUST_LOG 优先
fn default_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

// 设置日志
pub fn setup_logging() -> anyhow::Result<()> {
    let app_env = env_or_default("APP_ENV", ENVIRONMENT_LOCAL);

    // 结构化输出，便于按 user_id / strategy_id 字段检索
    if env_is_true("LOG_JSON", false) {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(default_filter("info"))
            .json()
            .with_current_span(false)
            .with_writer(std::io::stdout)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
        info!("Log configuration setup successfully! env={} format=json", app_env);
        return Ok(());
    }

    if app_env == ENVIRONMENT_LOCAL {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(default_filter("info"))
            .with_ansi(true)
            .with_target(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .with_writer(std::io::stdout)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
        info!("Log configuration setup successfully! env={}", app_env);
        return Ok(());
    }

    std::fs::create_dir_all(LOG_DIR)
        .map_err(|e| anyhow::anyhow!("Failed to create log directory '{}': {}", LOG_DIR, e))?;

    let info_file = RollingFileAppender::new(Rotation::DAILY, LOG_DIR, "info.log");
    let error_file = RollingFileAppender::new(Rotation::DAILY, LOG_DIR, "error.log");

    let (info_non_blocking, info_guard) = tracing_appender::non_blocking(info_file);
    let (error_non_blocking, error_guard) = tracing_appender::non_blocking(error_file);

    // 保存guard到全局，防止被丢弃
    INFO_GUARD
        .set(info_guard)
        .map_err(|_| anyhow::anyhow!("Failed to set INFO_GUARD"))?;
    ERROR_GUARD
        .set(error_guard)
        .map_err(|_| anyhow::anyhow!("Failed to set ERROR_GUARD"))?;

    let subscriber = Registry::default()
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_level(true)
                .with_writer(info_non_blocking)
                .with_filter(default_filter("info")),
        )
        .with(
            fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_level(true)
                .with_writer(error_non_blocking)
                .with_filter(EnvFilter::new("error")),
        );
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Log configuration setup successfully! env={}", app_env);
    Ok(())
}
