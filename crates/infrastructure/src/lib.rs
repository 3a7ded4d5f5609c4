//! 批处理调度器适配层：外部命令执行、脚本生成、各后端实现与作业步执行器

pub mod backends;
pub mod command;
pub mod executor;
pub mod scheduler_factory;
pub mod script;

pub use backends::{LocalScheduler, LsfScheduler, PbsScheduler, SgeScheduler, SlurmScheduler};
pub use command::{CommandOutput, CommandRequest, CommandRunner, TokioCommandRunner};
pub use executor::StepExecutor;
pub use scheduler_factory::SchedulerFactory;
pub use script::ScriptDialect;
