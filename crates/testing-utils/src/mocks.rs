//! Mock implementations of the scheduler and executor ports
//!
//! Both mocks keep their state behind `Arc<Mutex<..>>` so a test can hold a
//! clone and inspect or steer the state while the controller owns another.

use async_trait::async_trait;
use batchpool_domain::{
    BatchScheduler, GeneratedScript, JobId, JobState, Task, TaskExecutor, TaskId, TaskResult,
    WorkerHandle, WorkerId, WorkerPoolConfig,
};
use batchpool_errors::{SchedulerError, SchedulerResult};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
struct MockJob {
    pool: String,
    state: JobState,
}

#[derive(Debug)]
struct SchedulerState {
    next_id: u64,
    jobs: BTreeMap<JobId, MockJob>,
    submissions: Vec<(String, GeneratedScript)>,
    submission_attempts: usize,
    cancelled: Vec<JobId>,
    failures_remaining: usize,
    always_fail: bool,
    initial_state: JobState,
    rejected_pools: HashSet<String>,
    peak_active: HashMap<String, usize>,
}

impl SchedulerState {
    fn active_jobs(&self, pool: &str) -> usize {
        self.jobs
            .values()
            .filter(|job| job.pool == pool && !job.state.is_terminal())
            .count()
    }
}

/// In-memory batch scheduler
///
/// Jobs start in `Running` unless [`MockBatchScheduler::with_initial_state`]
/// says otherwise. Cancelled jobs move to `Failed`, as a cancelled job would
/// on a real cluster.
#[derive(Debug, Clone)]
pub struct MockBatchScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl MockBatchScheduler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState {
                next_id: 1000,
                jobs: BTreeMap::new(),
                submissions: Vec::new(),
                submission_attempts: 0,
                cancelled: Vec::new(),
                failures_remaining: 0,
                always_fail: false,
                initial_state: JobState::Running,
                rejected_pools: HashSet::new(),
                peak_active: HashMap::new(),
            })),
        }
    }

    pub fn with_initial_state(self, state: JobState) -> Self {
        self.state.lock().unwrap().initial_state = state;
        self
    }

    /// Reject the next `count` submissions
    pub fn fail_next_submissions(&self, count: usize) {
        self.state.lock().unwrap().failures_remaining = count;
    }

    pub fn fail_all_submissions(&self) {
        self.state.lock().unwrap().always_fail = true;
    }

    /// Make `validate_pool` reject the named pool
    pub fn reject_pool(&self, pool: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected_pools
            .insert(pool.to_string());
    }

    pub fn set_job_state(&self, job_id: &JobId, state: JobState) {
        if let Some(job) = self.state.lock().unwrap().jobs.get_mut(job_id) {
            job.state = state;
        }
    }

    /// Set the state of every non-terminal job of a pool
    pub fn set_pool_state(&self, pool: &str, state: JobState) {
        let mut inner = self.state.lock().unwrap();
        for job in inner.jobs.values_mut() {
            if job.pool == pool && !job.state.is_terminal() {
                job.state = state;
            }
        }
    }

    /// Drop the job from the scheduler's records so polling reports `Unknown`
    pub fn forget_job(&self, job_id: &JobId) {
        self.state.lock().unwrap().jobs.remove(job_id);
    }

    pub fn jobs_for_pool(&self, pool: &str) -> Vec<JobId> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .iter()
            .filter(|(_, job)| job.pool == pool)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn submissions(&self) -> Vec<(String, GeneratedScript)> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn submissions_for(&self, pool: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .submissions
            .iter()
            .filter(|(p, _)| p == pool)
            .count()
    }

    /// Successful and rejected submissions
    pub fn submission_attempts(&self) -> usize {
        self.state.lock().unwrap().submission_attempts
    }

    pub fn cancelled_jobs(&self) -> Vec<JobId> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn active_jobs(&self, pool: &str) -> usize {
        self.state.lock().unwrap().active_jobs(pool)
    }

    /// Highest number of simultaneously active jobs seen for a pool
    pub fn peak_active(&self, pool: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .peak_active
            .get(pool)
            .copied()
            .unwrap_or(0)
    }
}

impl Default for MockBatchScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchScheduler for MockBatchScheduler {
    fn name(&self) -> &str {
        "mock"
    }

    fn validate_pool(&self, pool: &WorkerPoolConfig) -> SchedulerResult<()> {
        if self.state.lock().unwrap().rejected_pools.contains(&pool.name) {
            return Err(SchedulerError::config_error(format!(
                "pool {} rejected",
                pool.name
            )));
        }
        Ok(())
    }

    fn render_script(
        &self,
        pool: &WorkerPoolConfig,
        worker_id: &str,
    ) -> SchedulerResult<GeneratedScript> {
        let job_name = format!("batchpool-{worker_id}");
        Ok(GeneratedScript {
            text: format!(
                "#!/bin/bash\n#MOCK --job-name={job_name}\n#MOCK --cpus={}\n{}\n",
                pool.resources.cpus, pool.launch_command
            ),
            job_name,
        })
    }

    async fn submit(&self, pool: &str, script: &GeneratedScript) -> SchedulerResult<JobId> {
        let mut inner = self.state.lock().unwrap();
        inner.submission_attempts += 1;
        if inner.always_fail {
            return Err(SchedulerError::submission(pool, "sbatch: error: QOSMaxSubmitJobPerUserLimit"));
        }
        if inner.failures_remaining > 0 {
            inner.failures_remaining -= 1;
            return Err(SchedulerError::submission(pool, "Socket timed out on send/recv operation"));
        }

        inner.next_id += 1;
        let job_id = JobId::new(inner.next_id.to_string());
        let state = inner.initial_state;
        inner.jobs.insert(
            job_id.clone(),
            MockJob {
                pool: pool.to_string(),
                state,
            },
        );
        inner
            .submissions
            .push((pool.to_string(), script.clone()));

        let active = inner.active_jobs(pool);
        let peak = inner.peak_active.entry(pool.to_string()).or_insert(0);
        *peak = (*peak).max(active);
        Ok(job_id)
    }

    async fn poll(&self, job_id: &JobId) -> SchedulerResult<JobState> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .get(job_id)
            .map(|job| job.state)
            .unwrap_or(JobState::Unknown))
    }

    async fn cancel(&self, job_id: &JobId) -> SchedulerResult<()> {
        let mut inner = self.state.lock().unwrap();
        if let Some(job) = inner.jobs.get_mut(job_id) {
            if !job.state.is_terminal() {
                job.state = JobState::Failed;
            }
        }
        inner.cancelled.push(job_id.clone());
        Ok(())
    }
}

/// Scripted behaviour for one execution of a task
#[derive(Debug, Clone)]
pub enum ScriptedResult {
    Succeed(String),
    Fail(String),
    /// The worker disappears while running the task
    LoseWorker,
    /// Never returns; only a timeout or abort ends it
    Hang,
}

#[derive(Debug, Default)]
struct ExecutorState {
    delay: Duration,
    scripted: HashMap<TaskId, VecDeque<ScriptedResult>>,
    executions: Vec<(TaskId, WorkerId)>,
    busy_workers: HashSet<WorkerId>,
    overlapping: usize,
}

/// Removes the worker from the busy set even when the execution is aborted
struct BusyGuard {
    state: Arc<Mutex<ExecutorState>>,
    worker_id: WorkerId,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.state.lock() {
            inner.busy_workers.remove(&self.worker_id);
        }
    }
}

/// Task executor with per-task scripted results
///
/// Unscripted executions succeed with `done {task_id}` after the configured delay.
#[derive(Debug, Clone, Default)]
pub struct MockTaskExecutor {
    state: Arc<Mutex<ExecutorState>>,
}

impl MockTaskExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.state.lock().unwrap().delay = delay;
        self
    }

    /// Results for successive executions of `task_id`
    pub fn script(&self, task_id: &str, results: Vec<ScriptedResult>) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .insert(task_id.to_string(), results.into());
    }

    pub fn fail_task(&self, task_id: &str, message: &str) {
        self.script(task_id, vec![ScriptedResult::Fail(message.to_string())]);
    }

    pub fn lose_worker_once(&self, task_id: &str) {
        self.script(task_id, vec![ScriptedResult::LoseWorker]);
    }

    pub fn executions(&self) -> Vec<(TaskId, WorkerId)> {
        self.state.lock().unwrap().executions.clone()
    }

    pub fn execution_count(&self, task_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .executions
            .iter()
            .filter(|(id, _)| id == task_id)
            .count()
    }

    /// Executions that started on a worker already running another task
    pub fn overlapping_executions(&self) -> usize {
        self.state.lock().unwrap().overlapping
    }
}

#[async_trait]
impl TaskExecutor for MockTaskExecutor {
    async fn execute(&self, worker: &WorkerHandle, task: &Task) -> SchedulerResult<TaskResult> {
        let (delay, scripted) = {
            let mut inner = self.state.lock().unwrap();
            inner
                .executions
                .push((task.id.clone(), worker.worker_id.clone()));
            if !inner.busy_workers.insert(worker.worker_id.clone()) {
                inner.overlapping += 1;
            }
            let scripted = inner
                .scripted
                .get_mut(&task.id)
                .and_then(|results| results.pop_front());
            (inner.delay, scripted)
        };
        let _guard = BusyGuard {
            state: Arc::clone(&self.state),
            worker_id: worker.worker_id.clone(),
        };

        tokio::time::sleep(delay).await;
        match scripted.unwrap_or_else(|| ScriptedResult::Succeed(format!("done {}", task.id))) {
            ScriptedResult::Succeed(output) => Ok(TaskResult {
                output,
                duration_ms: delay.as_millis() as u64,
            }),
            ScriptedResult::Fail(message) => Err(SchedulerError::task_execution(
                &task.id,
                &worker.pool,
                message,
            )),
            ScriptedResult::LoseWorker => Err(SchedulerError::WorkerLost {
                pool: worker.pool.clone(),
                worker_id: worker.worker_id.clone(),
                task_id: Some(task.id.clone()),
            }),
            ScriptedResult::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> WorkerPoolConfig {
        crate::PoolConfigBuilder::new("small").build()
    }

    #[tokio::test]
    async fn test_mock_scheduler_records_jobs() {
        let scheduler = MockBatchScheduler::new();
        let script = scheduler.render_script(&pool(), "small-w1").unwrap();
        let job_id = scheduler.submit("small", &script).await.unwrap();

        assert_eq!(scheduler.poll(&job_id).await.unwrap(), JobState::Running);
        assert_eq!(scheduler.active_jobs("small"), 1);
        assert_eq!(scheduler.peak_active("small"), 1);

        scheduler.cancel(&job_id).await.unwrap();
        scheduler.cancel(&job_id).await.unwrap();
        assert_eq!(scheduler.poll(&job_id).await.unwrap(), JobState::Failed);
        assert_eq!(scheduler.active_jobs("small"), 0);
        assert_eq!(scheduler.cancelled_jobs().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_scheduler_transient_failures() {
        let scheduler = MockBatchScheduler::new();
        scheduler.fail_next_submissions(1);
        let script = scheduler.render_script(&pool(), "small-w1").unwrap();

        assert!(scheduler.submit("small", &script).await.is_err());
        assert!(scheduler.submit("small", &script).await.is_ok());
        assert_eq!(scheduler.submission_attempts(), 2);
        assert_eq!(scheduler.submissions_for("small"), 1);
    }

    #[tokio::test]
    async fn test_mock_executor_scripted_results() {
        let executor = MockTaskExecutor::new();
        executor.script(
            "t1",
            vec![ScriptedResult::LoseWorker, ScriptedResult::Fail("boom".into())],
        );
        let worker = WorkerHandle {
            worker_id: "small-w1".into(),
            pool: "small".into(),
            job_id: JobId::new("1"),
        };
        let task = crate::TaskBuilder::new("t1").with_tag("small").build();

        assert!(executor.execute(&worker, &task).await.unwrap_err().is_worker_lost());
        assert!(matches!(
            executor.execute(&worker, &task).await.unwrap_err(),
            SchedulerError::TaskExecution { .. }
        ));
        assert_eq!(executor.execute(&worker, &task).await.unwrap().output, "done t1");
        assert_eq!(executor.execution_count("t1"), 3);
        assert_eq!(executor.overlapping_executions(), 0);
    }
}
