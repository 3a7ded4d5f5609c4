//! 持久化Worker池的调度核心
//!
//! 就绪任务按资源标签路由到池，在池内按FIFO分派给空闲Worker。
//! Worker的提交、状态轮询和取消都在后台任务中完成，结果通过事件回到分派循环。

pub mod dispatcher;
pub mod events;
pub mod metrics;
pub mod poller;
pub mod pool;
pub mod retry;
pub mod router;

pub use dispatcher::{Dispatcher, DispatcherSettings, StatsHandle};
pub use events::{DispatchEvent, RunSummary};
pub use poller::spawn_poller;
pub use pool::{PoolStatus, QueuedTask, WorkerPool};
pub use retry::Backoff;
pub use router::ControllerGroup;
