use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 批处理调度器后端类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    #[default]
    Slurm,
    Pbs,
    Sge,
    Lsf,
    /// 本机模拟后端，无需集群
    Local,
}

impl std::str::FromStr for SchedulerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "slurm" => Ok(SchedulerKind::Slurm),
            "pbs" => Ok(SchedulerKind::Pbs),
            "sge" => Ok(SchedulerKind::Sge),
            "lsf" => Ok(SchedulerKind::Lsf),
            "local" => Ok(SchedulerKind::Local),
            _ => Err(format!(
                "Invalid scheduler kind: {s}. Valid kinds: slurm, pbs, sge, lsf, local"
            )),
        }
    }
}

impl std::fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerKind::Slurm => write!(f, "slurm"),
            SchedulerKind::Pbs => write!(f, "pbs"),
            SchedulerKind::Sge => write!(f, "sge"),
            SchedulerKind::Lsf => write!(f, "lsf"),
            SchedulerKind::Local => write!(f, "local"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub kind: SchedulerKind,
    /// sbatch/squeue 等外部命令的超时
    pub command_timeout_seconds: u64,
    /// 在Worker作业内启动任务的命令模板，`{job_id}` 会被替换
    pub step_command: Option<Vec<String>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: SchedulerKind::Slurm,
            command_timeout_seconds: 30,
            step_command: None,
        }
    }
}

impl SchedulerConfig {
    /// 各后端默认的作业步命令，PBS/SGE/LSF需要显式配置；本地后端直接执行负载
    pub fn effective_step_command(&self) -> Option<Vec<String>> {
        if let Some(command) = &self.step_command {
            return Some(command.clone());
        }
        match self.kind {
            SchedulerKind::Slurm => Some(
                ["srun", "--jobid={job_id}", "--overlap", "--ntasks=1"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ),
            SchedulerKind::Local => Some(Vec::new()),
            _ => None,
        }
    }
}

impl ConfigValidator for SchedulerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_timeout_seconds(
            self.command_timeout_seconds,
            "scheduler.command_timeout_seconds",
        )?;

        if let Some(command) = &self.step_command {
            let Some(program) = command.first() else {
                return Err(crate::ConfigError::Validation(
                    "scheduler.step_command cannot be empty".to_string(),
                ));
            };
            ValidationUtils::validate_not_empty(program, "scheduler.step_command[0]")?;
        }

        // 非Slurm集群后端没有通用的作业步启动方式
        if !matches!(self.kind, SchedulerKind::Slurm | SchedulerKind::Local)
            && self.step_command.is_none()
        {
            return Err(crate::ConfigError::Validation(format!(
                "scheduler.step_command is required for the {} backend",
                self.kind
            )));
        }

        Ok(())
    }
}
