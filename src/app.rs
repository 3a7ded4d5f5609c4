use std::sync::Arc;

use anyhow::{Context, Result};
use batchpool_config::AppConfig;
use batchpool_dispatcher::{Dispatcher, DispatcherSettings, RunSummary};
use batchpool_domain::{
    BatchScheduler, GeneratedScript, Task, TaskExecutor, TaskOutcome, TaskOutcomeEvent,
};
use batchpool_infrastructure::SchedulerFactory;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::task_feed;

/// 组装调度器后端、执行器和分派循环
pub struct Application {
    config: AppConfig,
    scheduler: Arc<dyn BatchScheduler>,
    executor: Arc<dyn TaskExecutor>,
}

impl Application {
    pub fn new(config: AppConfig) -> Result<Self> {
        let scheduler = SchedulerFactory::create_scheduler(&config.scheduler);
        let executor =
            SchedulerFactory::create_executor(&config.scheduler).context("创建任务执行器失败")?;
        Ok(Self::with_components(config, scheduler, executor))
    }

    pub fn with_components(
        config: AppConfig,
        scheduler: Arc<dyn BatchScheduler>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self {
            config,
            scheduler,
            executor,
        }
    }

    /// 校验所有池并生成各池的示例Worker脚本
    pub fn check(&self) -> Result<Vec<(String, GeneratedScript)>> {
        let mut scripts = Vec::with_capacity(self.config.pools.len());
        for pool in &self.config.pools {
            self.scheduler
                .validate_pool(pool)
                .with_context(|| format!("池 {} 的脚本配置无效", pool.name))?;
            let script = self
                .scheduler
                .render_script(pool, &format!("{}-w1", pool.name))
                .with_context(|| format!("生成池 {} 的脚本失败", pool.name))?;
            scripts.push((pool.name.clone(), script));
        }
        Ok(scripts)
    }

    /// 执行一组任务直到全部结束或收到关闭信号
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<RunSummary> {
        let dispatcher = Dispatcher::new(
            DispatcherSettings::from_app_config(&self.config),
            self.config.pools.clone(),
            self.config.default_pool.clone(),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.executor),
        )
        .context("创建分派器失败")?;

        let batch_size = self.config.dispatcher.ready_batch_size;
        let (ready_tx, ready_rx) = mpsc::channel(4);
        let (outcome_tx, outcome_rx) = mpsc::channel(1024);

        info!(
            "开始执行 {} 个任务，{} 个池，后端 {}",
            tasks.len(),
            self.config.pools.len(),
            self.scheduler.name()
        );
        let feeder = tokio::spawn(task_feed::feed(tasks, batch_size, ready_tx));
        let reporter = tokio::spawn(log_outcomes(outcome_rx));

        let summary = dispatcher
            .run(ready_rx, outcome_tx, shutdown_rx)
            .await
            .context("分派循环失败")?;

        feeder.abort();
        if let Err(e) = reporter.await {
            warn!("结果日志任务异常退出: {}", e);
        }
        Ok(summary)
    }
}

async fn log_outcomes(mut outcomes: mpsc::Receiver<TaskOutcomeEvent>) {
    while let Some(event) = outcomes.recv().await {
        let pool = event.pool.as_deref().unwrap_or("-");
        match &event.outcome {
            TaskOutcome::Completed(result) => info!(
                task_id = %event.task_id,
                pool,
                duration_ms = result.duration_ms,
                "任务完成"
            ),
            TaskOutcome::Failed(e) => error!(task_id = %event.task_id, pool, "任务失败: {}", e),
            TaskOutcome::Cancelled => warn!(task_id = %event.task_id, pool, "任务已取消"),
        }
    }
}
