use async_trait::async_trait;
use batchpool_errors::SchedulerResult;

use crate::value_objects::{GeneratedScript, JobId, JobState, WorkerPoolConfig};

/// 批处理调度器适配接口（Slurm/PBS/SGE/LSF）
#[async_trait]
pub trait BatchScheduler: Send + Sync {
    /// 后端名称
    fn name(&self) -> &str;

    /// 在池构建时校验脚本行与生成指令的顺序和冲突
    fn validate_pool(&self, pool: &WorkerPoolConfig) -> SchedulerResult<()>;

    /// 为池中指定Worker生成提交脚本
    fn render_script(
        &self,
        pool: &WorkerPoolConfig,
        worker_id: &str,
    ) -> SchedulerResult<GeneratedScript>;

    /// 提交作业，调度器拒绝时返回 `SchedulerError::Submission`
    async fn submit(&self, pool: &str, script: &GeneratedScript) -> SchedulerResult<JobId>;

    /// 查询作业状态，调度器没有记录时返回 `JobState::Unknown`
    async fn poll(&self, job_id: &JobId) -> SchedulerResult<JobState>;

    /// 取消作业，对已结束的作业也返回成功
    async fn cancel(&self, job_id: &JobId) -> SchedulerResult<()>;
}
