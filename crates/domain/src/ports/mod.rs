//! 调度核心依赖的外部系统接口

mod batch_scheduler;
mod task_executor;

pub use batch_scheduler::BatchScheduler;
pub use task_executor::TaskExecutor;
