use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use batchpool_domain::{
    BatchScheduler, JobId, JobState, PoolStats, SchedulerError, SchedulerResult, Task, TaskId,
    Worker, WorkerHandle, WorkerId, WorkerPoolConfig, WorkerState,
};
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::events::DispatchEvent;
use crate::retry::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Active,
    /// 提交重试耗尽，拒绝新任务
    Degraded,
    ShuttingDown,
    Stopped,
}

/// 排队中的任务，`retries_used` 记录因Worker丢失而重新分派的次数
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task: Task,
    pub retries_used: u32,
}

impl QueuedTask {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            retries_used: 0,
        }
    }
}

struct PoolInner {
    workers: BTreeMap<WorkerId, Worker>,
    queue: VecDeque<QueuedTask>,
    status: PoolStatus,
    /// 状态查询失败后的下次查询时间
    poll_not_before: HashMap<WorkerId, Instant>,
    /// 已移除的死亡Worker数
    dead: usize,
    /// 连续在运行前退出的Worker数，Worker进入Running时清零
    early_deaths: u32,
    /// Worker在运行前退出后，下次提交新Worker的最早时间
    respawn_not_before: Option<Instant>,
}

impl PoolInner {
    /// 移除死亡的Worker，只保留计数
    fn retire(&mut self, worker_id: &str) -> Option<Worker> {
        self.poll_not_before.remove(worker_id);
        let mut worker = self.workers.remove(worker_id)?;
        set_state(&mut worker, WorkerState::Dead);
        self.dead += 1;
        Some(worker)
    }

    fn respawn_delayed(&self) -> bool {
        self.respawn_not_before
            .is_some_and(|not_before| Instant::now() < not_before)
    }

    fn count(&self, state: WorkerState) -> usize {
        self.workers.values().filter(|w| w.state == state).count()
    }

    fn live_workers(&self) -> usize {
        self.workers.values().filter(|w| w.is_live()).count()
    }

    /// 不含正在终止的Worker，用于最小Worker数判断
    fn serving_workers(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.is_live() && w.state != WorkerState::Terminating)
            .count()
    }
}

fn set_state(worker: &mut Worker, state: WorkerState) {
    worker.state = state;
    worker.last_transition = Utc::now();
}

fn invalid_transition(worker: &Worker, to: WorkerState) -> SchedulerError {
    SchedulerError::InvalidTransition {
        worker_id: worker.id.clone(),
        from: worker.state.to_string(),
        to: to.to_string(),
    }
}

/// 共享同一资源配置的一组持久化Worker
///
/// Worker状态只在池锁内修改。作业提交、取消和状态查询都在后台任务中进行，
/// 结果通过事件通道回到分派循环。
pub struct WorkerPool {
    config: Arc<WorkerPoolConfig>,
    scheduler: Arc<dyn BatchScheduler>,
    backoff: Backoff,
    unknown_threshold: u32,
    events: mpsc::UnboundedSender<DispatchEvent>,
    inner: RwLock<PoolInner>,
    seq: AtomicU64,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        scheduler: Arc<dyn BatchScheduler>,
        backoff: Backoff,
        unknown_threshold: u32,
        events: mpsc::UnboundedSender<DispatchEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            scheduler,
            backoff,
            unknown_threshold: unknown_threshold.max(1),
            events,
            inner: RwLock::new(PoolInner {
                workers: BTreeMap::new(),
                queue: VecDeque::new(),
                status: PoolStatus::Active,
                poll_not_before: HashMap::new(),
                dead: 0,
                early_deaths: 0,
                respawn_not_before: None,
            }),
            seq: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub async fn status(&self) -> PoolStatus {
        self.inner.read().await.status
    }

    /// 提交 `min_workers` 个初始Worker
    pub async fn start(self: &Arc<Self>) {
        let mut inner = self.inner.write().await;
        self.replenish(&mut inner);
    }

    pub async fn enqueue(&self, task: Task) -> SchedulerResult<()> {
        self.push(QueuedTask::new(task), false).await
    }

    /// Worker丢失后重新排到队首
    pub async fn requeue_front(&self, queued: QueuedTask) -> SchedulerResult<()> {
        self.push(queued, true).await
    }

    async fn push(&self, queued: QueuedTask, front: bool) -> SchedulerResult<()> {
        let mut inner = self.inner.write().await;
        match inner.status {
            PoolStatus::Active => {}
            PoolStatus::Degraded => {
                return Err(SchedulerError::PoolDegraded {
                    pool: self.config.name.clone(),
                    task_id: queued.task.id,
                })
            }
            PoolStatus::ShuttingDown | PoolStatus::Stopped => {
                return Err(SchedulerError::Internal(format!(
                    "池 {} 已停止，拒绝任务 {}",
                    self.config.name, queued.task.id
                )))
            }
        }

        debug!("任务 {} 进入池 {} 队列", queued.task.id, self.config.name);
        if front {
            inner.queue.push_front(queued);
        } else {
            inner.queue.push_back(queued);
        }
        Ok(())
    }

    pub async fn pop_task(&self) -> Option<QueuedTask> {
        self.inner.write().await.queue.pop_front()
    }

    pub async fn queued_len(&self) -> usize {
        self.inner.read().await.queue.len()
    }

    /// 立即返回一个空闲Worker。没有空闲Worker时，在容量允许的范围内
    /// 为尚未有Worker接手的排队任务在后台提交新Worker，并返回 `None`。
    #[instrument(skip(self), fields(pool = %self.config.name))]
    pub async fn acquire_worker(self: &Arc<Self>) -> Option<WorkerId> {
        let mut inner = self.inner.write().await;
        if inner.status != PoolStatus::Active {
            return None;
        }

        if let Some(worker) = inner.workers.values().find(|w| w.is_idle()) {
            return Some(worker.id.clone());
        }
        if inner.respawn_delayed() {
            return None;
        }

        let mut starting = inner.count(WorkerState::Pending) + inner.count(WorkerState::Running);
        while inner.live_workers() < self.config.max_workers && starting < inner.queue.len() {
            self.spawn_worker(&mut inner);
            starting += 1;
        }
        None
    }

    pub async fn mark_busy(&self, worker_id: &str, task_id: &str) -> SchedulerResult<WorkerHandle> {
        let mut inner = self.inner.write().await;
        let worker = self.worker_mut(&mut inner, worker_id)?;
        if worker.state != WorkerState::Idle {
            return Err(invalid_transition(worker, WorkerState::Busy));
        }
        let handle = worker.handle().ok_or_else(|| {
            SchedulerError::Internal(format!("空闲Worker {worker_id} 没有作业ID"))
        })?;

        set_state(worker, WorkerState::Busy);
        worker.current_task = Some(task_id.to_string());
        worker.idle_since = None;
        debug!("Worker {} 开始执行任务 {}", worker_id, task_id);
        Ok(handle)
    }

    pub async fn mark_idle(&self, worker_id: &str) -> SchedulerResult<()> {
        let mut inner = self.inner.write().await;
        let worker = self.worker_mut(&mut inner, worker_id)?;
        if !matches!(worker.state, WorkerState::Busy | WorkerState::Running) {
            return Err(invalid_transition(worker, WorkerState::Idle));
        }

        set_state(worker, WorkerState::Idle);
        worker.current_task = None;
        worker.idle_since = Some(Utc::now());
        Ok(())
    }

    /// 标记Worker死亡，返回它正在执行的任务。作业在后台取消，
    /// 池低于最小Worker数时补充新Worker。
    pub async fn mark_dead(self: &Arc<Self>, worker_id: &str) -> SchedulerResult<Option<TaskId>> {
        let mut inner = self.inner.write().await;
        let worker = inner
            .retire(worker_id)
            .ok_or_else(|| self.not_found(worker_id))?;
        warn!("池 {} Worker {} 已死亡", self.config.name, worker_id);

        if let Some(job_id) = worker.job_id {
            self.cancel_in_background(job_id);
        }
        self.replenish(&mut inner);
        Ok(worker.current_task)
    }

    fn worker_mut<'a>(
        &self,
        inner: &'a mut PoolInner,
        worker_id: &str,
    ) -> SchedulerResult<&'a mut Worker> {
        inner
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| self.not_found(worker_id))
    }

    fn not_found(&self, worker_id: &str) -> SchedulerError {
        SchedulerError::WorkerNotFound {
            pool: self.config.name.clone(),
            worker_id: worker_id.to_string(),
        }
    }

    fn spawn_worker(self: &Arc<Self>, inner: &mut PoolInner) -> WorkerId {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let worker_id = format!("{}-w{}", self.config.name, seq);
        inner.workers.insert(
            worker_id.clone(),
            Worker::new_pending(worker_id.clone(), self.config.name.clone()),
        );
        info!("池 {} 提交新Worker {}", self.config.name, worker_id);

        let pool = Arc::clone(self);
        let id = worker_id.clone();
        tokio::spawn(async move { pool.submit_worker(id).await });
        worker_id
    }

    /// 池处于活动状态时补足最小Worker数
    fn replenish(self: &Arc<Self>, inner: &mut PoolInner) {
        if inner.status != PoolStatus::Active || inner.respawn_delayed() {
            return;
        }
        while inner.serving_workers() < self.config.min_workers {
            self.spawn_worker(inner);
        }
    }

    fn cancel_in_background(&self, job_id: JobId) {
        let scheduler = Arc::clone(&self.scheduler);
        let pool = self.config.name.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.cancel(&job_id).await {
                warn!("池 {} 取消作业 {} 失败: {}", pool, job_id, e);
            }
        });
    }

    async fn submit_worker(self: Arc<Self>, worker_id: WorkerId) {
        let script = match self.scheduler.render_script(&self.config, &worker_id) {
            Ok(script) => script,
            Err(e) => {
                self.fail_submission(&worker_id, e).await;
                return;
            }
        };

        let max_attempts = self.backoff.max_attempts();
        let mut last_error = None;
        for attempt in 0..max_attempts {
            if !self.still_pending(&worker_id).await {
                debug!("Worker {} 不再需要，停止提交", worker_id);
                return;
            }

            match self.scheduler.submit(&self.config.name, &script).await {
                Ok(job_id) => {
                    self.record_submitted(&worker_id, job_id).await;
                    return;
                }
                Err(e) => {
                    warn!(
                        "池 {} Worker {} 第 {}/{} 次提交失败: {}",
                        self.config.name,
                        worker_id,
                        attempt + 1,
                        max_attempts,
                        e
                    );
                    last_error = Some(e);
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(self.backoff.delay(attempt)).await;
                    }
                }
            }
        }

        let error = match last_error {
            Some(e @ SchedulerError::Submission { .. }) => e,
            Some(e) => SchedulerError::submission(&self.config.name, e.to_string()),
            None => SchedulerError::submission(&self.config.name, "没有进行提交"),
        };
        self.fail_submission(&worker_id, error).await;
    }

    /// Worker仍处于Pending且池仍可用；否则把它标记为死亡
    async fn still_pending(&self, worker_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let pending = inner
            .workers
            .get(worker_id)
            .is_some_and(|w| w.state == WorkerState::Pending);
        if !pending {
            return false;
        }
        if inner.status != PoolStatus::Active {
            inner.retire(worker_id);
            return false;
        }
        true
    }

    async fn record_submitted(&self, worker_id: &str, job_id: JobId) {
        let mut inner = self.inner.write().await;
        let accepting = matches!(inner.status, PoolStatus::Active | PoolStatus::Degraded);
        if let Some(worker) = inner.workers.get_mut(worker_id) {
            if worker.state == WorkerState::Pending && accepting {
                info!("池 {} Worker {} 已提交为作业 {}", self.config.name, worker_id, job_id);
                worker.job_id = Some(job_id);
                return;
            }
        }

        // 提交期间Worker已被放弃
        if inner.retire(worker_id).is_some() {
            debug!("Worker {} 已被放弃，取消作业 {}", worker_id, job_id);
        }
        self.cancel_in_background(job_id);
    }

    async fn fail_submission(&self, worker_id: &str, error: SchedulerError) {
        let mut inner = self.inner.write().await;
        inner.retire(worker_id);
        self.degrade(&mut inner, error);
    }

    /// 池降级并让所有排队任务失败。清空队列和发送事件在同一次加锁内完成，
    /// 分派循环看到空队列时事件已在通道中。
    fn degrade(&self, inner: &mut PoolInner, error: SchedulerError) {
        match inner.status {
            PoolStatus::Active => inner.status = PoolStatus::Degraded,
            PoolStatus::Degraded => {}
            PoolStatus::ShuttingDown | PoolStatus::Stopped => return,
        }

        let tasks: Vec<Task> = inner.queue.drain(..).map(|q| q.task).collect();
        error!(
            "池 {} 无法启动Worker，池已降级，{} 个排队任务失败: {}",
            self.config.name,
            tasks.len(),
            error
        );
        let _ = self.events.send(DispatchEvent::SubmissionFailed {
            pool: self.config.name.clone(),
            error,
            tasks,
        });
    }

    /// Worker在进入Running之前退出。按提交退避延迟下一次提交，
    /// 连续次数达到提交上限时池降级。
    fn record_early_death(&self, inner: &mut PoolInner, reason: &str) {
        inner.early_deaths += 1;
        let limit = self.backoff.max_attempts();
        if inner.early_deaths >= limit {
            let error = SchedulerError::submission(
                &self.config.name,
                format!("连续 {} 个Worker在运行前退出: {}", inner.early_deaths, reason),
            );
            self.degrade(inner, error);
            return;
        }

        let delay = self.backoff.delay(inner.early_deaths - 1);
        warn!(
            "池 {} 第 {}/{} 个Worker在运行前退出，{:?} 后再提交",
            self.config.name, inner.early_deaths, limit, delay
        );
        inner.respawn_not_before = Some(Instant::now() + delay);
    }

    /// 查询所有带作业ID的存活Worker，更新状态并回收空闲超时的Worker
    pub async fn poll_workers(self: &Arc<Self>) {
        let now = Instant::now();
        let targets: Vec<(WorkerId, JobId)> = {
            let inner = self.inner.read().await;
            inner
                .workers
                .values()
                .filter(|w| w.state.needs_poll())
                .filter(|w| {
                    inner
                        .poll_not_before
                        .get(&w.id)
                        .map_or(true, |not_before| *not_before <= now)
                })
                .filter_map(|w| w.job_id.clone().map(|job| (w.id.clone(), job)))
                .collect()
        };

        let results = join_all(targets.iter().map(|(_, job)| self.scheduler.poll(job))).await;

        let mut inner = self.inner.write().await;
        for ((worker_id, job_id), result) in targets.into_iter().zip(results) {
            self.apply_poll(&mut inner, &worker_id, &job_id, result);
        }
        self.reap_idle(&mut inner);
        self.replenish(&mut inner);
    }

    fn apply_poll(
        self: &Arc<Self>,
        inner: &mut PoolInner,
        worker_id: &str,
        job_id: &JobId,
        result: SchedulerResult<JobState>,
    ) {
        let Some(worker) = inner.workers.get_mut(worker_id) else {
            return;
        };
        if worker.job_id.as_ref() != Some(job_id) {
            return;
        }

        let lost_reason = match result {
            Ok(JobState::Running) => {
                worker.unknown_polls = 0;
                if worker.state == WorkerState::Pending {
                    set_state(worker, WorkerState::Running);
                    inner.early_deaths = 0;
                    inner.respawn_not_before = None;
                    info!("池 {} Worker {} 作业 {} 已运行", self.config.name, worker_id, job_id);
                    let _ = self.events.send(DispatchEvent::WorkerReady {
                        pool: self.config.name.clone(),
                        worker_id: worker_id.to_string(),
                    });
                }
                None
            }
            Ok(JobState::Queued) => {
                worker.unknown_polls = 0;
                match worker.state {
                    WorkerState::Pending | WorkerState::Terminating => None,
                    _ => Some("作业被重新排队".to_string()),
                }
            }
            Ok(state @ (JobState::Completed | JobState::Failed)) => {
                Some(format!("作业已结束: {state}"))
            }
            Ok(JobState::Unknown) | Err(_) if worker.state == WorkerState::Terminating => {
                Some("作业已不存在".to_string())
            }
            other => {
                worker.unknown_polls += 1;
                if let Err(e) = other {
                    warn!("查询Worker {} 作业 {} 状态失败: {}", worker_id, job_id, e);
                }
                if worker.unknown_polls >= self.unknown_threshold {
                    Some(format!("连续 {} 次无法确认作业状态", worker.unknown_polls))
                } else {
                    let delay = self.backoff.delay(worker.unknown_polls - 1);
                    inner
                        .poll_not_before
                        .insert(worker_id.to_string(), Instant::now() + delay);
                    None
                }
            }
        };

        let Some(reason) = lost_reason else {
            return;
        };

        let previous = worker.state;
        let Some(worker) = inner.retire(worker_id) else {
            return;
        };

        if previous == WorkerState::Terminating {
            debug!("池 {} Worker {} 已终止", self.config.name, worker_id);
            return;
        }

        warn!(
            "池 {} Worker {} 丢失 (作业 {}): {}",
            self.config.name, worker_id, job_id, reason
        );
        let _ = self.events.send(DispatchEvent::WorkerLost {
            pool: self.config.name.clone(),
            worker_id: worker_id.to_string(),
            task_id: worker.current_task,
        });
        self.cancel_in_background(job_id.clone());
        if previous == WorkerState::Pending {
            self.record_early_death(inner, &reason);
        }
        self.replenish(inner);
    }

    /// 空闲超时的Worker在高于最小Worker数时被终止
    fn reap_idle(self: &Arc<Self>, inner: &mut PoolInner) {
        let Some(idle_timeout) = self.config.idle_timeout_seconds else {
            return;
        };
        if inner.status != PoolStatus::Active {
            return;
        }

        let now = Utc::now();
        let candidates: Vec<WorkerId> = inner
            .workers
            .values()
            .filter(|w| w.idle_longer_than(idle_timeout, now))
            .map(|w| w.id.clone())
            .collect();

        for worker_id in candidates {
            if inner.serving_workers() <= self.config.min_workers {
                break;
            }
            let Some(worker) = inner.workers.get_mut(&worker_id) else {
                continue;
            };
            set_state(worker, WorkerState::Terminating);
            worker.idle_since = None;
            info!("池 {} 回收空闲Worker {}", self.config.name, worker_id);

            if let Some(job_id) = worker.job_id.clone() {
                let pool = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = pool.scheduler.cancel(&job_id).await {
                        warn!("取消空闲Worker {} 的作业 {} 失败: {}", worker_id, job_id, e);
                    }
                    pool.finish_termination(&worker_id).await;
                });
            }
        }
    }

    async fn finish_termination(&self, worker_id: &str) {
        let mut inner = self.inner.write().await;
        let terminating = inner
            .workers
            .get(worker_id)
            .is_some_and(|w| w.state == WorkerState::Terminating);
        if terminating {
            inner.retire(worker_id);
        }
    }

    /// 清空队列并取消所有存活Worker的作业，返回被清空的任务
    #[instrument(skip(self), fields(pool = %self.config.name))]
    pub async fn shutdown(&self) -> Vec<QueuedTask> {
        let (drained, jobs) = {
            let mut inner = self.inner.write().await;
            if inner.status == PoolStatus::Stopped {
                return Vec::new();
            }
            inner.status = PoolStatus::ShuttingDown;

            let drained: Vec<QueuedTask> = inner.queue.drain(..).collect();
            let mut jobs = Vec::new();
            for worker in inner.workers.values_mut().filter(|w| w.is_live()) {
                set_state(worker, WorkerState::Terminating);
                if let Some(job_id) = &worker.job_id {
                    jobs.push(job_id.clone());
                }
            }
            (drained, jobs)
        };

        info!("池 {} 正在关闭，取消 {} 个作业", self.config.name, jobs.len());
        let results = join_all(jobs.iter().map(|job| self.scheduler.cancel(job))).await;
        for (job_id, result) in jobs.iter().zip(results) {
            if let Err(e) = result {
                warn!("池 {} 取消作业 {} 失败: {}", self.config.name, job_id, e);
            }
        }

        let mut inner = self.inner.write().await;
        let remaining: Vec<WorkerId> = inner.workers.keys().cloned().collect();
        for worker_id in remaining {
            inner.retire(&worker_id);
        }
        inner.poll_not_before.clear();
        inner.status = PoolStatus::Stopped;
        drained
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.read().await;
        let busy = inner.count(WorkerState::Busy);
        PoolStats {
            pool: self.config.name.clone(),
            pending: inner.count(WorkerState::Pending),
            running: inner.count(WorkerState::Running),
            idle: inner.count(WorkerState::Idle),
            busy,
            terminating: inner.count(WorkerState::Terminating),
            dead: inner.dead,
            queued_tasks: inner.queue.len(),
            in_flight_tasks: busy,
            degraded: inner.status == PoolStatus::Degraded,
        }
    }

    pub async fn workers(&self) -> Vec<Worker> {
        self.inner.read().await.workers.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchpool_config::RetryConfig;
    use batchpool_testing_utils::{MockBatchScheduler, PoolConfigBuilder, TaskBuilder, TestEnv};
    use std::time::Duration;

    fn fast_backoff(attempts: u32) -> Backoff {
        Backoff::from_config(&RetryConfig {
            submit_max_attempts: attempts,
            base_interval_ms: 5,
            max_interval_ms: 20,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        })
    }

    fn pool_with(
        config: WorkerPoolConfig,
        scheduler: &MockBatchScheduler,
        attempts: u32,
    ) -> (Arc<WorkerPool>, mpsc::UnboundedReceiver<DispatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(
            config,
            Arc::new(scheduler.clone()),
            fast_backoff(attempts),
            2,
            tx,
        );
        (pool, rx)
    }

    async fn wait_until<F, Fut>(check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        assert!(
            TestEnv::wait_for(check, Duration::from_secs(2)).await,
            "condition not reached in time"
        );
    }

    /// 提交并轮询，直到Worker变为空闲
    async fn ready_worker(
        pool: &Arc<WorkerPool>,
        rx: &mut mpsc::UnboundedReceiver<DispatchEvent>,
    ) -> WorkerId {
        assert!(pool.acquire_worker().await.is_none());
        let p = Arc::clone(pool);
        wait_until(|| {
            let p = Arc::clone(&p);
            async move { p.workers().await.iter().any(|w| w.job_id.is_some()) }
        })
        .await;
        pool.poll_workers().await;
        match rx.recv().await {
            Some(DispatchEvent::WorkerReady { worker_id, .. }) => {
                pool.mark_idle(&worker_id).await.unwrap();
                worker_id
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_acquire_respects_max_workers() {
        let scheduler = MockBatchScheduler::new();
        let config = PoolConfigBuilder::new("small").max_workers(2).build();
        let (pool, _rx) = pool_with(config, &scheduler, 3);

        for i in 0..3 {
            pool.enqueue(TaskBuilder::new(&format!("t{i}")).with_tag("small").build())
                .await
                .unwrap();
        }
        for _ in 0..5 {
            assert!(pool.acquire_worker().await.is_none());
        }

        let stats = pool.stats().await;
        assert_eq!(stats.live_workers(), 2);
        assert_eq!(stats.queued_tasks, 3);
    }

    #[tokio::test]
    async fn test_acquire_without_queue_does_not_spawn() {
        let scheduler = MockBatchScheduler::new();
        let (pool, _rx) = pool_with(PoolConfigBuilder::new("small").build(), &scheduler, 3);
        assert!(pool.acquire_worker().await.is_none());
        assert_eq!(pool.stats().await.live_workers(), 0);
    }

    #[tokio::test]
    async fn test_worker_lifecycle_transitions() {
        let scheduler = MockBatchScheduler::new();
        let (pool, mut rx) = pool_with(PoolConfigBuilder::new("small").build(), &scheduler, 3);
        pool.enqueue(TaskBuilder::new("t1").with_tag("small").build())
            .await
            .unwrap();

        let worker_id = ready_worker(&pool, &mut rx).await;
        assert_eq!(pool.acquire_worker().await, Some(worker_id.clone()));

        let handle = pool.mark_busy(&worker_id, "t1").await.unwrap();
        assert_eq!(handle.pool, "small");
        assert_eq!(pool.stats().await.in_flight_tasks, 1);

        // Busy的Worker不能再次被占用
        let err = pool.mark_busy(&worker_id, "t2").await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));

        pool.mark_idle(&worker_id).await.unwrap();
        assert!(pool.mark_idle(&worker_id).await.is_err());

        pool.mark_busy(&worker_id, "t2").await.unwrap();
        let task = pool.mark_dead(&worker_id).await.unwrap();
        assert_eq!(task.as_deref(), Some("t2"));
        assert!(pool.mark_dead(&worker_id).await.is_err());

        let job_id = handle.job_id.clone();
        let s = scheduler.clone();
        wait_until(|| {
            let s = s.clone();
            let job_id = job_id.clone();
            async move { s.cancelled_jobs().contains(&job_id) }
        })
        .await;
    }

    #[tokio::test]
    async fn test_unknown_state_past_threshold_loses_worker() {
        let scheduler = MockBatchScheduler::new();
        let (pool, mut rx) = pool_with(PoolConfigBuilder::new("small").build(), &scheduler, 3);
        pool.enqueue(TaskBuilder::new("t1").with_tag("small").build())
            .await
            .unwrap();
        let worker_id = ready_worker(&pool, &mut rx).await;
        pool.mark_busy(&worker_id, "t1").await.unwrap();

        scheduler.set_pool_state("small", JobState::Unknown);
        pool.poll_workers().await;
        assert_eq!(pool.stats().await.busy, 1);

        // 第二次查询需等待退避时间
        tokio::time::sleep(Duration::from_millis(30)).await;
        pool.poll_workers().await;

        match rx.recv().await {
            Some(DispatchEvent::WorkerLost { worker_id: lost, task_id, .. }) => {
                assert_eq!(lost, worker_id);
                assert_eq!(task_id.as_deref(), Some("t1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(pool.stats().await.dead, 1);
    }

    #[tokio::test]
    async fn test_terminal_job_loses_worker() {
        let scheduler = MockBatchScheduler::new();
        let (pool, mut rx) = pool_with(PoolConfigBuilder::new("small").build(), &scheduler, 3);
        pool.enqueue(TaskBuilder::new("t1").with_tag("small").build())
            .await
            .unwrap();
        let worker_id = ready_worker(&pool, &mut rx).await;

        scheduler.set_pool_state("small", JobState::Failed);
        pool.poll_workers().await;
        match rx.recv().await {
            Some(DispatchEvent::WorkerLost { worker_id: lost, task_id, .. }) => {
                assert_eq!(lost, worker_id);
                assert!(task_id.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_submission_exhaustion_degrades_pool() {
        let scheduler = MockBatchScheduler::new();
        scheduler.fail_all_submissions();
        let (pool, mut rx) = pool_with(PoolConfigBuilder::new("small").build(), &scheduler, 3);
        pool.enqueue(TaskBuilder::new("t1").with_tag("small").build())
            .await
            .unwrap();
        assert!(pool.acquire_worker().await.is_none());
        pool.enqueue(TaskBuilder::new("t2").with_tag("small").build())
            .await
            .unwrap();

        match rx.recv().await {
            Some(DispatchEvent::SubmissionFailed { pool: name, error, tasks }) => {
                assert_eq!(name, "small");
                assert!(matches!(error, SchedulerError::Submission { .. }));
                let ids: Vec<_> = tasks.iter().map(|t| t.id.as_str()).collect();
                assert_eq!(ids, vec!["t1", "t2"]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(scheduler.submission_attempts(), 3);
        assert_eq!(pool.status().await, PoolStatus::Degraded);

        let err = pool
            .enqueue(TaskBuilder::new("t3").with_tag("small").build())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::PoolDegraded { .. }));
    }

    #[tokio::test]
    async fn test_workers_exiting_before_running_degrade_pool() {
        let scheduler = MockBatchScheduler::new().with_initial_state(JobState::Failed);
        let config = PoolConfigBuilder::new("small").max_workers(1).build();
        let (pool, mut rx) = pool_with(config, &scheduler, 3);
        pool.enqueue(TaskBuilder::new("t1").with_tag("small").build())
            .await
            .unwrap();

        for round in 1..=3 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(pool.acquire_worker().await.is_none());
            let p = Arc::clone(&pool);
            wait_until(|| {
                let p = Arc::clone(&p);
                async move { p.workers().await.iter().any(|w| w.job_id.is_some()) }
            })
            .await;
            pool.poll_workers().await;

            if round < 3 {
                // 退避期间不提交新Worker
                assert!(pool.acquire_worker().await.is_none());
                assert_eq!(pool.stats().await.live_workers(), 0);
                assert_eq!(scheduler.submissions_for("small"), round);
            }
        }

        let mut lost = 0;
        loop {
            match rx.recv().await {
                Some(DispatchEvent::WorkerLost { task_id, .. }) => {
                    assert!(task_id.is_none());
                    lost += 1;
                }
                Some(DispatchEvent::SubmissionFailed { error, tasks, .. }) => {
                    assert!(matches!(error, SchedulerError::Submission { .. }));
                    let ids: Vec<_> = tasks.iter().map(|t| t.id.as_str()).collect();
                    assert_eq!(ids, vec!["t1"]);
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(lost, 3);
        assert_eq!(pool.status().await, PoolStatus::Degraded);
        assert_eq!(scheduler.submissions_for("small"), 3);

        let stats = pool.stats().await;
        assert_eq!(stats.dead, 3);
        assert!(pool.workers().await.is_empty());
    }

    #[tokio::test]
    async fn test_worker_running_after_early_exit_keeps_pool_active() {
        let scheduler = MockBatchScheduler::new().with_initial_state(JobState::Failed);
        let config = PoolConfigBuilder::new("small").max_workers(1).build();
        let (pool, mut rx) = pool_with(config, &scheduler, 2);
        pool.enqueue(TaskBuilder::new("t1").with_tag("small").build())
            .await
            .unwrap();

        assert!(pool.acquire_worker().await.is_none());
        let p = Arc::clone(&pool);
        wait_until(|| {
            let p = Arc::clone(&p);
            async move { p.workers().await.iter().any(|w| w.job_id.is_some()) }
        })
        .await;
        pool.poll_workers().await;
        assert!(matches!(rx.recv().await, Some(DispatchEvent::WorkerLost { .. })));

        // 退避后提交的Worker正常运行
        let scheduler = scheduler.with_initial_state(JobState::Running);
        tokio::time::sleep(Duration::from_millis(30)).await;
        ready_worker(&pool, &mut rx).await;
        assert_eq!(pool.status().await, PoolStatus::Active);
        assert_eq!(scheduler.submissions_for("small"), 2);
    }

    #[tokio::test]
    async fn test_transient_submission_failure_is_retried() {
        let scheduler = MockBatchScheduler::new();
        scheduler.fail_next_submissions(2);
        let (pool, mut rx) = pool_with(PoolConfigBuilder::new("small").build(), &scheduler, 3);
        pool.enqueue(TaskBuilder::new("t1").with_tag("small").build())
            .await
            .unwrap();

        ready_worker(&pool, &mut rx).await;
        assert_eq!(scheduler.submission_attempts(), 3);
        assert_eq!(pool.status().await, PoolStatus::Active);
    }

    #[tokio::test]
    async fn test_min_workers_floor() {
        let scheduler = MockBatchScheduler::new();
        let config = PoolConfigBuilder::new("small")
            .max_workers(3)
            .min_workers(1)
            .build();
        let (pool, mut rx) = pool_with(config, &scheduler, 3);
        pool.start().await;
        assert_eq!(pool.stats().await.pending, 1);

        let p = Arc::clone(&pool);
        wait_until(|| {
            let p = Arc::clone(&p);
            async move { p.workers().await.iter().any(|w| w.job_id.is_some()) }
        })
        .await;
        pool.poll_workers().await;
        let Some(DispatchEvent::WorkerReady { worker_id, .. }) = rx.recv().await else {
            panic!("expected WorkerReady");
        };
        pool.mark_idle(&worker_id).await.unwrap();

        // 低于最小Worker数时替换死亡的Worker
        pool.mark_dead(&worker_id).await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.dead, 1);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn test_idle_worker_reaped_after_timeout() {
        let scheduler = MockBatchScheduler::new();
        let config = PoolConfigBuilder::new("small").idle_timeout_seconds(0).build();
        let (pool, mut rx) = pool_with(config, &scheduler, 3);
        pool.enqueue(TaskBuilder::new("t1").with_tag("small").build())
            .await
            .unwrap();
        let worker_id = ready_worker(&pool, &mut rx).await;
        pool.pop_task().await;

        pool.poll_workers().await;
        let p = Arc::clone(&pool);
        wait_until(|| {
            let p = Arc::clone(&p);
            async move { p.stats().await.dead == 1 }
        })
        .await;
        assert_eq!(scheduler.cancelled_jobs().len(), 1);
        assert!(pool
            .workers()
            .await
            .iter()
            .all(|w| w.id != worker_id || w.state == WorkerState::Dead));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_jobs_and_drains_queue() {
        let scheduler = MockBatchScheduler::new();
        let config = PoolConfigBuilder::new("small").max_workers(2).build();
        let (pool, mut rx) = pool_with(config, &scheduler, 3);
        pool.enqueue(TaskBuilder::new("t1").with_tag("small").build())
            .await
            .unwrap();
        ready_worker(&pool, &mut rx).await;
        pool.enqueue(TaskBuilder::new("t2").with_tag("small").build())
            .await
            .unwrap();

        let drained = pool.shutdown().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(pool.status().await, PoolStatus::Stopped);
        assert_eq!(pool.stats().await.live_workers(), 0);
        assert_eq!(scheduler.cancelled_jobs().len(), 1);

        // 重复关闭没有副作用
        assert!(pool.shutdown().await.is_empty());
        assert_eq!(scheduler.cancelled_jobs().len(), 1);
    }
}
