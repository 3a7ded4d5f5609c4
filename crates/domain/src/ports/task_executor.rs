use async_trait::async_trait;
use batchpool_errors::SchedulerResult;

use crate::entities::{Task, TaskResult, WorkerHandle};

/// 把任务负载发送到正在运行的Worker并等待结果
///
/// 返回 `SchedulerError::WorkerLost` 表示Worker本身已不可用，
/// 其他错误视为任务逻辑失败，原样上报且不重试。
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, worker: &WorkerHandle, task: &Task) -> SchedulerResult<TaskResult>;
}
