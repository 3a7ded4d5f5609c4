use std::sync::Arc;
use std::time::Duration;

use batchpool_config::{SchedulerConfig, SchedulerKind};
use batchpool_domain::{BatchScheduler, TaskExecutor};
use batchpool_errors::{SchedulerError, SchedulerResult};
use tracing::info;

use crate::backends::{LocalScheduler, LsfScheduler, PbsScheduler, SgeScheduler, SlurmScheduler};
use crate::command::{CommandRunner, TokioCommandRunner};
use crate::executor::StepExecutor;

/// 按配置创建调度器适配器和任务执行器
pub struct SchedulerFactory;

impl SchedulerFactory {
    pub fn create_scheduler(config: &SchedulerConfig) -> Arc<dyn BatchScheduler> {
        let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner::with_timeout(
            Duration::from_secs(config.command_timeout_seconds),
        ));
        Self::create_scheduler_with_runner(config.kind, runner)
    }

    pub fn create_scheduler_with_runner(
        kind: SchedulerKind,
        runner: Arc<dyn CommandRunner>,
    ) -> Arc<dyn BatchScheduler> {
        info!("使用批处理调度器后端: {}", kind);
        match kind {
            SchedulerKind::Slurm => Arc::new(SlurmScheduler::new(runner)),
            SchedulerKind::Pbs => Arc::new(PbsScheduler::new(runner)),
            SchedulerKind::Sge => Arc::new(SgeScheduler::new(runner)),
            SchedulerKind::Lsf => Arc::new(LsfScheduler::new(runner)),
            SchedulerKind::Local => Arc::new(LocalScheduler::new()),
        }
    }

    /// 作业步不设命令超时，由分派循环的任务超时约束
    pub fn create_executor(config: &SchedulerConfig) -> SchedulerResult<Arc<dyn TaskExecutor>> {
        let template = config.effective_step_command().ok_or_else(|| {
            SchedulerError::config_error(format!(
                "{} 后端需要配置 scheduler.step_command",
                config.kind
            ))
        })?;
        Ok(Arc::new(StepExecutor::new(
            Arc::new(TokioCommandRunner::new()),
            template,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_scheduler_for_each_kind() {
        for (kind, name) in [
            (SchedulerKind::Slurm, "slurm"),
            (SchedulerKind::Pbs, "pbs"),
            (SchedulerKind::Sge, "sge"),
            (SchedulerKind::Lsf, "lsf"),
            (SchedulerKind::Local, "local"),
        ] {
            let config = SchedulerConfig {
                kind,
                ..SchedulerConfig::default()
            };
            assert_eq!(SchedulerFactory::create_scheduler(&config).name(), name);
        }
    }

    #[test]
    fn test_create_executor_requires_step_command() {
        let pbs = SchedulerConfig {
            kind: SchedulerKind::Pbs,
            ..SchedulerConfig::default()
        };
        assert!(SchedulerFactory::create_executor(&pbs).is_err());

        let slurm = SchedulerConfig::default();
        assert!(SchedulerFactory::create_executor(&slurm).is_ok());
    }
}
