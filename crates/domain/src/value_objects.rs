use std::fmt;

use serde::{Deserialize, Serialize};

/// 一个Worker池的资源需求，池创建后不可变
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    pub cpus: u32,
    pub memory_gb: f64,
    #[serde(default)]
    pub gpus: u32,
    /// 作业墙钟时间，格式由调度器决定（如 `01:00:00`）
    #[serde(default)]
    pub walltime: Option<String>,
    /// 分区/队列
    #[serde(default)]
    pub queue: Option<String>,
    /// 计费账户/项目
    #[serde(default)]
    pub account: Option<String>,
    /// 原样追加的调度器参数，按顺序生成指令行
    #[serde(default)]
    pub extra_flags: Vec<String>,
    /// 启动Worker前执行的环境准备命令（如 `module load`）
    #[serde(default)]
    pub setup_lines: Vec<String>,
}

impl ResourceSpec {
    pub fn new(cpus: u32, memory_gb: f64) -> Self {
        Self {
            cpus,
            memory_gb,
            gpus: 0,
            walltime: None,
            queue: None,
            account: None,
            extra_flags: Vec::new(),
            setup_lines: Vec::new(),
        }
    }

    /// 内存向上取整到MiB
    pub fn memory_mb(&self) -> u64 {
        (self.memory_gb * 1024.0).ceil() as u64
    }
}

fn default_launch_command() -> String {
    "exec sleep infinity".to_string()
}

/// 单个Worker池的配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    pub name: String,
    pub resources: ResourceSpec,
    pub max_workers: usize,
    /// 池中保持存活的最少Worker数，低于此值时替换死亡的Worker
    #[serde(default)]
    pub min_workers: usize,
    /// 追加到生成脚本中的自由格式行，其中的指令行必须位于任何Shell命令之前
    #[serde(default)]
    pub script_lines: Vec<String>,
    /// 持久化Worker作业最后执行的命令
    #[serde(default = "default_launch_command")]
    pub launch_command: String,
    #[serde(default)]
    pub idle_timeout_seconds: Option<u64>,
}

impl WorkerPoolConfig {
    pub fn new<S: Into<String>>(name: S, resources: ResourceSpec, max_workers: usize) -> Self {
        Self {
            name: name.into(),
            resources,
            max_workers,
            min_workers: 0,
            script_lines: Vec::new(),
            launch_command: default_launch_command(),
            idle_timeout_seconds: None,
        }
    }
}

/// 批处理调度器分配的作业ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 调度器报告的作业状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    /// 调度器已无该作业的记录，视为终态未知
    Unknown,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Unknown
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// 提交给调度器的脚本文本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedScript {
    pub job_name: String,
    pub text: String,
}

impl GeneratedScript {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines()
    }
}
