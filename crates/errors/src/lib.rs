use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchedulerError {
    #[error("作业提交失败: 池 {pool} - {message}")]
    Submission { pool: String, message: String },
    #[error("Worker丢失: 池 {pool} Worker {worker_id} (任务: {})", task_id.as_deref().unwrap_or("-"))]
    WorkerLost {
        pool: String,
        worker_id: String,
        task_id: Option<String>,
    },
    #[error("任务无法路由: 任务 {task_id} 的资源标签 {tag} 没有匹配的Worker池")]
    UnroutableTask { task_id: String, tag: String },
    #[error("任务执行错误: 任务 {task_id} (池 {pool}) - {message}")]
    TaskExecution {
        task_id: String,
        pool: String,
        message: String,
    },
    #[error("作业状态查询超时: 池 {pool} 作业 {job_id}")]
    PollTimeout { pool: String, job_id: String },
    #[error("任务最终失败: 任务 {task_id} (池 {pool}) - {reason}")]
    TaskFailed {
        task_id: String,
        pool: String,
        reason: String,
    },
    #[error("Worker池已降级: 池 {pool} 拒绝任务 {task_id}")]
    PoolDegraded { pool: String, task_id: String },
    #[error("重复的任务ID: {task_id}")]
    DuplicateTask { task_id: String },
    #[error("Worker未找到: 池 {pool} Worker {worker_id}")]
    WorkerNotFound { pool: String, worker_id: String },
    #[error("非法的Worker状态转换: Worker {worker_id} 从 {from} 到 {to}")]
    InvalidTransition {
        worker_id: String,
        from: String,
        to: String,
    },
    #[error("外部命令执行失败: {command} - {message}")]
    CommandFailed { command: String, message: String },
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn submission<P: Into<String>, S: Into<String>>(pool: P, message: S) -> Self {
        Self::Submission {
            pool: pool.into(),
            message: message.into(),
        }
    }
    pub fn unroutable<T: Into<String>, S: Into<String>>(task_id: T, tag: S) -> Self {
        Self::UnroutableTask {
            task_id: task_id.into(),
            tag: tag.into(),
        }
    }
    pub fn task_execution<T: Into<String>, P: Into<String>, S: Into<String>>(
        task_id: T,
        pool: P,
        message: S,
    ) -> Self {
        Self::TaskExecution {
            task_id: task_id.into(),
            pool: pool.into(),
            message: message.into(),
        }
    }
    pub fn command_failed<C: Into<String>, S: Into<String>>(command: C, message: S) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Internal(_)
                | SchedulerError::Configuration(_)
                | SchedulerError::UnroutableTask { .. }
        )
    }
    /// 基础设施类的瞬时错误，本地带退避重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Submission { .. }
                | SchedulerError::CommandFailed { .. }
                | SchedulerError::PollTimeout { .. }
                | SchedulerError::Timeout(_)
        )
    }
    pub fn is_worker_lost(&self) -> bool {
        matches!(self, SchedulerError::WorkerLost { .. })
    }
    /// 错误关联的任务ID（如果有）
    pub fn task_id(&self) -> Option<&str> {
        match self {
            SchedulerError::WorkerLost { task_id, .. } => task_id.as_deref(),
            SchedulerError::UnroutableTask { task_id, .. }
            | SchedulerError::TaskExecution { task_id, .. }
            | SchedulerError::TaskFailed { task_id, .. }
            | SchedulerError::PoolDegraded { task_id, .. }
            | SchedulerError::DuplicateTask { task_id } => Some(task_id),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for SchedulerError {
    fn from(err: std::io::Error) -> Self {
        SchedulerError::Internal(format!("IO错误: {err}"))
    }
}
