//! 运行时状态定时对账任务

use std::sync::Arc;

use anyhow::anyhow;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info};

use crate::trading::strategy::StrategyManager;

/// 按 cron 表达式周期执行 `StrategyManager::reconcile`
pub fn build_reconcile_job(manager: Arc<StrategyManager>, cron_expression: &str) -> anyhow::Result<Job> {
    let job = Job::new_async(cron_expression, move |_uuid, _lock| {
        let manager = Arc::clone(&manager);
        Box::pin(async move {
            match manager.reconcile().await {
                Ok(report) => debug!(
                    "定时对账完成 removed={} rematerialized={} errored={} failed={}",
                    report.removed.len(),
                    report.rematerialized.len(),
                    report.errored.len(),
                    report.failed.len()
                ),
                Err(e) => error!("定时对账失败: {}", e),
            }
        })
    })
    .map_err(|e| anyhow!("创建对账任务失败 cron={}: {}", cron_expression, e))?;
    Ok(job)
}

/// 创建并启动任务调度器，注册对账任务
pub async fn start_reconcile_scheduler(
    manager: Arc<StrategyManager>,
    cron_expression: &str,
) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new()
        .await
        .map_err(|e| anyhow!("初始化任务调度器失败: {}", e))?;
    let job = build_reconcile_job(manager, cron_expression)?;
    let job_id = scheduler
        .add(job)
        .await
        .map_err(|e| anyhow!("添加对账任务失败: {}", e))?;
    scheduler
        .start()
        .await
        .map_err(|e| anyhow!("启动任务调度器失败: {}", e))?;
    info!("对账任务已启动 job_id={} cron={}", job_id, cron_expression);
    Ok(scheduler)
}
