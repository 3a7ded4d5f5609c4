use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use batchpool_domain::{BatchScheduler, GeneratedScript, JobId, JobState, WorkerPoolConfig};
use batchpool_errors::SchedulerResult;
use tokio::sync::RwLock;
use tracing::debug;

use crate::script::{job_name, ScriptDialect};

const DIALECT: ScriptDialect = ScriptDialect {
    directive_prefix: "#LOCAL",
    reserved_flags: &["job-name", "cpus", "mem"],
};

/// 本机后端：作业只是进程内的记录，提交后立即处于运行状态
///
/// 与 [`crate::StepExecutor`] 的空模板配合，任务直接在本机执行。
#[derive(Debug, Default)]
pub struct LocalScheduler {
    jobs: RwLock<HashMap<JobId, JobState>>,
    next_id: AtomicU64,
}

impl LocalScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchScheduler for LocalScheduler {
    fn name(&self) -> &str {
        "local"
    }

    fn validate_pool(&self, pool: &WorkerPoolConfig) -> SchedulerResult<()> {
        DIALECT.validate_pool(pool)
    }

    fn render_script(
        &self,
        pool: &WorkerPoolConfig,
        worker_id: &str,
    ) -> SchedulerResult<GeneratedScript> {
        let directives = vec![
            format!("job-name={}", job_name(worker_id)),
            format!("cpus={}", pool.resources.cpus),
            format!("mem={}M", pool.resources.memory_mb()),
        ];
        Ok(DIALECT.render(pool, worker_id, directives))
    }

    async fn submit(&self, _pool: &str, script: &GeneratedScript) -> SchedulerResult<JobId> {
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let job_id = JobId::new(format!("local-{seq}"));
        self.jobs
            .write()
            .await
            .insert(job_id.clone(), JobState::Running);
        debug!("本地作业已创建: {} ({})", job_id, script.job_name);
        Ok(job_id)
    }

    async fn poll(&self, job_id: &JobId) -> SchedulerResult<JobState> {
        Ok(self
            .jobs
            .read()
            .await
            .get(job_id)
            .copied()
            .unwrap_or(JobState::Unknown))
    }

    async fn cancel(&self, job_id: &JobId) -> SchedulerResult<()> {
        if let Some(state) = self.jobs.write().await.get_mut(job_id) {
            if !state.is_terminal() {
                *state = JobState::Completed;
            }
        }
        Ok(())
    }
}
