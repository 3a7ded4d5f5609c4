//! 向上游任务图引擎报告的任务结果事件

use batchpool_errors::SchedulerError;

use crate::entities::{TaskId, TaskResult};

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(TaskResult),
    Failed(SchedulerError),
    Cancelled,
}

impl TaskOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Completed(_) => "completed",
            TaskOutcome::Failed(_) => "failed",
            TaskOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcomeEvent {
    pub task_id: TaskId,
    /// 无法路由的任务没有所属池
    pub pool: Option<String>,
    pub outcome: TaskOutcome,
}

impl TaskOutcomeEvent {
    pub fn completed(task_id: TaskId, pool: &str, result: TaskResult) -> Self {
        Self {
            task_id,
            pool: Some(pool.to_string()),
            outcome: TaskOutcome::Completed(result),
        }
    }

    pub fn failed(task_id: TaskId, pool: Option<&str>, error: SchedulerError) -> Self {
        Self {
            task_id,
            pool: pool.map(str::to_string),
            outcome: TaskOutcome::Failed(error),
        }
    }

    pub fn cancelled(task_id: TaskId, pool: &str) -> Self {
        Self {
            task_id,
            pool: Some(pool.to_string()),
            outcome: TaskOutcome::Cancelled,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Completed(_))
    }
}
