use batchpool_domain::{SchedulerError, Task, TaskId, TaskResult, WorkerId};
use serde::Serialize;

/// 池、轮询器和执行任务发回分派循环的事件
#[derive(Debug)]
pub enum DispatchEvent {
    /// 轮询观察到作业开始运行
    WorkerReady { pool: String, worker_id: WorkerId },
    /// Worker已死亡，`task_id` 是它当时正在执行的任务
    WorkerLost {
        pool: String,
        worker_id: WorkerId,
        task_id: Option<TaskId>,
    },
    /// 提交重试耗尽，池已降级，`tasks` 是被清空的排队任务
    SubmissionFailed {
        pool: String,
        error: SchedulerError,
        tasks: Vec<Task>,
    },
    /// 一次执行结束，`attempt` 用于丢弃过期结果
    TaskFinished {
        task_id: TaskId,
        attempt: u64,
        result: Result<TaskResult, SchedulerError>,
    },
}

/// 一次运行的结果统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}
