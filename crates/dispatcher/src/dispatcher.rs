use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use batchpool_config::{
    AppConfig, ConfigResult, ConfigValidator, DispatcherConfig, PollerConfig, RetryConfig,
};
use batchpool_domain::{
    BatchScheduler, PoolStats, SchedulerError, SchedulerResult, Task, TaskExecutor, TaskId,
    TaskOutcome, TaskOutcomeEvent, TaskResult, WorkerHandle, WorkerId, WorkerPoolConfig,
};
use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::events::{DispatchEvent, RunSummary};
use crate::metrics;
use crate::poller::spawn_poller;
use crate::pool::{QueuedTask, WorkerPool};
use crate::retry::Backoff;
use crate::router::ControllerGroup;

/// 分派循环使用的配置子集
#[derive(Debug, Clone, Default)]
pub struct DispatcherSettings {
    pub dispatcher: DispatcherConfig,
    pub poller: PollerConfig,
    pub retry: RetryConfig,
}

impl DispatcherSettings {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            dispatcher: config.dispatcher.clone(),
            poller: config.poller.clone(),
            retry: config.retry.clone(),
        }
    }
}

impl ConfigValidator for DispatcherSettings {
    fn validate(&self) -> ConfigResult<()> {
        self.dispatcher.validate()?;
        self.poller.validate()?;
        self.retry.validate()
    }
}

/// 只读的池统计句柄，可在 `run` 期间从其他任务读取
#[derive(Clone)]
pub struct StatsHandle {
    group: Arc<ControllerGroup>,
}

impl StatsHandle {
    pub async fn snapshot(&self) -> Vec<PoolStats> {
        self.group.snapshot().await
    }
}

/// 正在执行的任务
struct InFlight {
    pool: Arc<WorkerPool>,
    worker_id: WorkerId,
    attempt: u64,
    retries_used: u32,
    task: Task,
    handle: JoinHandle<()>,
}

/// 把上游就绪任务分派到各池的持久化Worker上执行
pub struct Dispatcher {
    settings: DispatcherSettings,
    group: Arc<ControllerGroup>,
    executor: Arc<dyn TaskExecutor>,
    events_tx: mpsc::UnboundedSender<DispatchEvent>,
    events_rx: mpsc::UnboundedReceiver<DispatchEvent>,
}

impl Dispatcher {
    pub fn new(
        settings: DispatcherSettings,
        pools: Vec<WorkerPoolConfig>,
        default_pool: Option<String>,
        scheduler: Arc<dyn BatchScheduler>,
        executor: Arc<dyn TaskExecutor>,
    ) -> SchedulerResult<Self> {
        settings.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let group = ControllerGroup::new(
            pools,
            default_pool,
            scheduler,
            Backoff::from_config(&settings.retry),
            settings.poller.unknown_threshold,
            events_tx.clone(),
        )?;

        Ok(Self {
            settings,
            group: Arc::new(group),
            executor,
            events_tx,
            events_rx,
        })
    }

    pub async fn stats(&self) -> Vec<PoolStats> {
        self.group.snapshot().await
    }

    pub fn stats_handle(&self) -> StatsHandle {
        StatsHandle {
            group: Arc::clone(&self.group),
        }
    }

    /// 运行分派循环
    ///
    /// 上游关闭 `ready` 且所有任务都有结果后正常返回。收到关闭信号时，
    /// 执行中和排队中的任务都报告为 `Cancelled`。两种情况下返回前都会
    /// 取消所有池中的存活作业。
    #[instrument(skip_all)]
    pub async fn run(
        self,
        mut ready: mpsc::Receiver<Vec<Task>>,
        outcomes: mpsc::Sender<TaskOutcomeEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> SchedulerResult<RunSummary> {
        let Dispatcher {
            settings,
            group,
            executor,
            events_tx,
            mut events_rx,
        } = self;

        group.start_all().await;
        let (poller_tx, _) = broadcast::channel(1);
        let poll_interval = Duration::from_millis(settings.poller.interval_ms);
        let pollers: Vec<JoinHandle<()>> = group
            .pools()
            .map(|pool| spawn_poller(Arc::clone(pool), poll_interval, poller_tx.subscribe()))
            .collect();

        let mut ticker = interval(Duration::from_millis(settings.dispatcher.tick_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut state = DispatchLoop {
            settings,
            group: Arc::clone(&group),
            executor,
            events_tx,
            outcomes,
            in_flight: HashMap::new(),
            seen: HashSet::new(),
            next_attempt: 0,
            summary: RunSummary::default(),
        };

        info!("分派循环已启动");
        let mut upstream_open = true;
        let mut shutdown_open = true;
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                signal = shutdown.recv(), if shutdown_open => match signal {
                    Ok(()) | Err(RecvError::Lagged(_)) => {
                        warn!("收到关闭信号，取消剩余任务");
                        cancelled = true;
                        break;
                    }
                    Err(RecvError::Closed) => shutdown_open = false,
                },
                Some(event) = events_rx.recv() => state.handle_event(event).await,
                batch = ready.recv(), if upstream_open => match batch {
                    Some(tasks) => state.accept_batch(tasks).await,
                    None => {
                        info!("上游任务通道已关闭，等待剩余任务完成");
                        upstream_open = false;
                    }
                },
                _ = ticker.tick() => {}
            }

            state.dispatch_pending().await;
            metrics::publish(&group.snapshot().await);

            if !upstream_open && state.is_idle().await {
                // 池在同一次加锁内清空队列并发送事件，队列为空时事件已在通道中
                match events_rx.try_recv() {
                    Ok(event) => state.handle_event(event).await,
                    Err(_) => break,
                }
            }
        }

        state.drain_events(&mut events_rx).await;
        if cancelled {
            state.cancel_in_flight().await;
        }
        for (pool, tasks) in group.shutdown_all().await {
            for queued in tasks {
                state
                    .report(TaskOutcomeEvent::cancelled(queued.task.id, &pool))
                    .await;
            }
        }
        // 关闭前已降级的池可能还有未处理的提交失败事件
        state.drain_events(&mut events_rx).await;

        let _ = poller_tx.send(());
        for result in join_all(pollers).await {
            if let Err(e) = result {
                error!("轮询任务异常退出: {}", e);
            }
        }
        metrics::publish(&group.snapshot().await);

        let summary = state.summary;
        info!(
            "分派循环结束: 完成 {}，失败 {}，取消 {}",
            summary.completed, summary.failed, summary.cancelled
        );
        Ok(summary)
    }
}

/// `run` 期间由分派循环独占的状态
struct DispatchLoop {
    settings: DispatcherSettings,
    group: Arc<ControllerGroup>,
    executor: Arc<dyn TaskExecutor>,
    events_tx: mpsc::UnboundedSender<DispatchEvent>,
    outcomes: mpsc::Sender<TaskOutcomeEvent>,
    in_flight: HashMap<TaskId, InFlight>,
    seen: HashSet<TaskId>,
    next_attempt: u64,
    summary: RunSummary,
}

impl DispatchLoop {
    async fn accept_batch(&mut self, tasks: Vec<Task>) {
        debug!("收到 {} 个就绪任务", tasks.len());
        for task in tasks {
            let task_id = task.id.clone();
            let routed = self.group.route(&task);

            if !self.seen.insert(task_id.clone()) {
                let pool = routed.as_ref().ok().map(|p| p.name().to_string());
                warn!("任务 {} 重复提交，已拒绝", task_id);
                self.report(TaskOutcomeEvent::failed(
                    task_id.clone(),
                    pool.as_deref(),
                    SchedulerError::DuplicateTask { task_id },
                ))
                .await;
                continue;
            }

            let pool = match routed {
                Ok(pool) => pool,
                Err(e) => {
                    warn!("任务 {} 无法路由: {}", task_id, e);
                    self.report(TaskOutcomeEvent::failed(task_id, None, e)).await;
                    continue;
                }
            };

            if let Err(e) = pool.enqueue(task).await {
                self.report(TaskOutcomeEvent::failed(task_id, Some(pool.name()), e))
                    .await;
            }
        }
    }

    /// 每个池按FIFO把排队任务交给空闲Worker，没有空闲Worker时任务继续排队
    async fn dispatch_pending(&mut self) {
        let pools: Vec<Arc<WorkerPool>> = self.group.pools().cloned().collect();
        for pool in pools {
            while pool.queued_len().await > 0 {
                let Some(worker_id) = pool.acquire_worker().await else {
                    break;
                };
                let Some(queued) = pool.pop_task().await else {
                    break;
                };

                match pool.mark_busy(&worker_id, &queued.task.id).await {
                    Ok(handle) => self.launch(&pool, handle, queued),
                    Err(e) => {
                        debug!("Worker {} 无法接收任务: {}", worker_id, e);
                        let task_id = queued.task.id.clone();
                        if let Err(e) = pool.requeue_front(queued).await {
                            self.report(TaskOutcomeEvent::failed(task_id, Some(pool.name()), e))
                                .await;
                        }
                        break;
                    }
                }
            }
        }
    }

    fn launch(&mut self, pool: &Arc<WorkerPool>, worker: WorkerHandle, queued: QueuedTask) {
        self.next_attempt += 1;
        let attempt = self.next_attempt;
        let timeout = Duration::from_secs(self.settings.dispatcher.task_timeout_seconds);
        let executor = Arc::clone(&self.executor);
        let events = self.events_tx.clone();
        let task = queued.task.clone();
        let worker_id = worker.worker_id.clone();

        info!(
            "任务 {} 分派到池 {} 的Worker {} (第 {} 次重试)",
            task.id,
            pool.name(),
            worker_id,
            queued.retries_used
        );
        let handle = tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, executor.execute(&worker, &task)).await {
                Ok(result) => result,
                Err(_) => Err(SchedulerError::Timeout(format!(
                    "任务 {} 在池 {} 的Worker {} 上超过 {} 秒未完成",
                    task.id,
                    worker.pool,
                    worker.worker_id,
                    timeout.as_secs()
                ))),
            };
            let _ = events.send(DispatchEvent::TaskFinished {
                task_id: task.id,
                attempt,
                result,
            });
        });

        self.in_flight.insert(
            queued.task.id.clone(),
            InFlight {
                pool: Arc::clone(pool),
                worker_id,
                attempt,
                retries_used: queued.retries_used,
                task: queued.task,
                handle,
            },
        );
    }

    async fn handle_event(&mut self, event: DispatchEvent) {
        match event {
            DispatchEvent::WorkerReady { pool, worker_id } => {
                if let Some(pool) = self.group.pool(&pool) {
                    if let Err(e) = pool.mark_idle(&worker_id).await {
                        debug!("Worker {} 就绪事件已过期: {}", worker_id, e);
                    }
                }
            }
            DispatchEvent::WorkerLost {
                pool,
                worker_id,
                task_id,
            } => {
                let Some(task_id) = task_id else {
                    return;
                };
                let matches = self
                    .in_flight
                    .get(&task_id)
                    .is_some_and(|entry| entry.worker_id == worker_id);
                if !matches {
                    return;
                }
                if let Some(entry) = self.in_flight.remove(&task_id) {
                    entry.handle.abort();
                    let reason = format!("池 {pool} 的Worker {worker_id} 丢失");
                    self.requeue_or_fail(entry, reason).await;
                }
            }
            DispatchEvent::SubmissionFailed { pool, error, tasks } => {
                for task in tasks {
                    self.report(TaskOutcomeEvent::failed(task.id, Some(&pool), error.clone()))
                        .await;
                }
            }
            DispatchEvent::TaskFinished {
                task_id,
                attempt,
                result,
            } => self.finish(task_id, attempt, result).await,
        }
    }

    /// 处理通道中剩余的事件，不等待新事件
    async fn drain_events(&mut self, events_rx: &mut mpsc::UnboundedReceiver<DispatchEvent>) {
        while let Ok(event) = events_rx.try_recv() {
            self.handle_event(event).await;
        }
    }

    async fn finish(
        &mut self,
        task_id: TaskId,
        attempt: u64,
        result: SchedulerResult<TaskResult>,
    ) {
        let entry = match self.in_flight.remove(&task_id) {
            Some(entry) if entry.attempt == attempt => entry,
            Some(entry) => {
                debug!("丢弃任务 {} 第 {} 次执行的过期结果", task_id, attempt);
                self.in_flight.insert(task_id, entry);
                return;
            }
            None => {
                debug!("丢弃任务 {} 的过期结果", task_id);
                return;
            }
        };

        match result {
            Ok(result) => {
                if let Err(e) = entry.pool.mark_idle(&entry.worker_id).await {
                    debug!("Worker {} 无法回到空闲状态: {}", entry.worker_id, e);
                }
                let event = TaskOutcomeEvent::completed(task_id, entry.pool.name(), result);
                self.report(event).await;
            }
            Err(e) if e.is_worker_lost() || matches!(e, SchedulerError::Timeout(_)) => {
                warn!("任务 {} 的Worker {} 不可用: {}", task_id, entry.worker_id, e);
                if let Err(err) = entry.pool.mark_dead(&entry.worker_id).await {
                    debug!("Worker {} 已被标记为死亡: {}", entry.worker_id, err);
                }
                self.requeue_or_fail(entry, e.to_string()).await;
            }
            Err(e) => {
                if let Err(err) = entry.pool.mark_idle(&entry.worker_id).await {
                    debug!("Worker {} 无法回到空闲状态: {}", entry.worker_id, err);
                }
                let error = match e {
                    e @ SchedulerError::TaskExecution { .. } => e,
                    other => SchedulerError::task_execution(
                        task_id.clone(),
                        entry.pool.name(),
                        other.to_string(),
                    ),
                };
                let event = TaskOutcomeEvent::failed(task_id, Some(entry.pool.name()), error);
                self.report(event).await;
            }
        }
    }

    /// Worker丢失后重新排到队首，重试次数用尽时报告一次 `TaskFailed`
    async fn requeue_or_fail(&mut self, entry: InFlight, reason: String) {
        let task_id = entry.task.id.clone();
        let pool = entry.pool;
        let max_retries = self.settings.dispatcher.max_task_retries;

        if entry.retries_used < max_retries {
            info!(
                "任务 {} 重新排队 ({}/{}): {}",
                task_id,
                entry.retries_used + 1,
                max_retries,
                reason
            );
            let queued = QueuedTask {
                task: entry.task,
                retries_used: entry.retries_used + 1,
            };
            if let Err(e) = pool.requeue_front(queued).await {
                self.report(TaskOutcomeEvent::failed(task_id, Some(pool.name()), e))
                    .await;
            }
            return;
        }

        let error = SchedulerError::TaskFailed {
            task_id: task_id.clone(),
            pool: pool.name().to_string(),
            reason: format!("重试 {} 次后仍失败: {}", entry.retries_used, reason),
        };
        error!("{}", error);
        self.report(TaskOutcomeEvent::failed(task_id, Some(pool.name()), error))
            .await;
    }

    async fn cancel_in_flight(&mut self) {
        let in_flight: Vec<(TaskId, InFlight)> = self.in_flight.drain().collect();
        for (task_id, entry) in in_flight {
            entry.handle.abort();
            self.report(TaskOutcomeEvent::cancelled(task_id, entry.pool.name()))
                .await;
        }
    }

    async fn is_idle(&self) -> bool {
        if !self.in_flight.is_empty() {
            return false;
        }
        for pool in self.group.pools() {
            if pool.queued_len().await > 0 {
                return false;
            }
        }
        true
    }

    async fn report(&mut self, event: TaskOutcomeEvent) {
        match &event.outcome {
            TaskOutcome::Completed(_) => self.summary.completed += 1,
            TaskOutcome::Failed(e) => {
                self.summary.failed += 1;
                debug!("任务 {} 失败: {}", event.task_id, e);
            }
            TaskOutcome::Cancelled => self.summary.cancelled += 1,
        }
        metrics::record_outcome(event.pool.as_deref(), event.outcome.label());

        let task_id = event.task_id.clone();
        if self.outcomes.send(event).await.is_err() {
            warn!("结果接收端已关闭，任务 {} 的结果未送达", task_id);
        }
    }
}
