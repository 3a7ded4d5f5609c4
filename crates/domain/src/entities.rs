use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value_objects::JobId;

pub type TaskId = String;
pub type WorkerId = String;

/// 上游任务图引擎产生的就绪任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    /// 必须与某个池名完全匹配，否则回落到默认池
    pub resource_profile_tag: String,
    /// 对调度核心不透明
    #[serde(default)]
    pub payload: serde_json::Value,
    /// 由外部任务图引擎维护，这里只透传
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
}

impl Task {
    pub fn new<I: Into<String>, T: Into<String>>(
        id: I,
        resource_profile_tag: T,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            resource_profile_tag: resource_profile_tag.into(),
            payload,
            dependencies: BTreeSet::new(),
        }
    }
}

/// Worker状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// 作业已提交或正在提交，尚未运行
    Pending,
    /// 作业已运行，尚未被分派循环接管
    Running,
    Idle,
    Busy,
    Terminating,
    Dead,
}

impl WorkerState {
    /// 非Dead的Worker都占用池容量
    pub fn is_live(&self) -> bool {
        !matches!(self, WorkerState::Dead)
    }

    /// 需要轮询调度器状态的Worker
    pub fn needs_poll(&self) -> bool {
        !matches!(self, WorkerState::Dead)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Pending => "Pending",
            WorkerState::Running => "Running",
            WorkerState::Idle => "Idle",
            WorkerState::Busy => "Busy",
            WorkerState::Terminating => "Terminating",
            WorkerState::Dead => "Dead",
        };
        f.write_str(s)
    }
}

/// 持久化Worker，由所属池独占
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: WorkerId,
    pub pool: String,
    pub job_id: Option<JobId>,
    pub state: WorkerState,
    pub current_task: Option<TaskId>,
    pub launch_time: DateTime<Utc>,
    pub last_transition: DateTime<Utc>,
    pub idle_since: Option<DateTime<Utc>>,
    /// 连续得到Unknown或查询失败的次数
    pub unknown_polls: u32,
}

impl Worker {
    pub fn new_pending<I: Into<String>, P: Into<String>>(id: I, pool: P) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            pool: pool.into(),
            job_id: None,
            state: WorkerState::Pending,
            current_task: None,
            launch_time: now,
            last_transition: now,
            idle_since: None,
            unknown_polls: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    pub fn is_idle(&self) -> bool {
        self.state == WorkerState::Idle
    }

    /// 检查Worker空闲是否超过给定秒数
    pub fn idle_longer_than(&self, seconds: u64, now: DateTime<Utc>) -> bool {
        match self.idle_since {
            Some(since) if self.is_idle() => (now - since).num_seconds() >= seconds as i64,
            _ => false,
        }
    }

    pub fn handle(&self) -> Option<WorkerHandle> {
        self.job_id.as_ref().map(|job_id| WorkerHandle {
            worker_id: self.id.clone(),
            pool: self.pool.clone(),
            job_id: job_id.clone(),
        })
    }
}

/// 交给执行器的Worker定位信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub worker_id: WorkerId,
    pub pool: String,
    pub job_id: JobId,
}

/// 任务在Worker上成功执行的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub output: String,
    pub duration_ms: u64,
}

/// 单个池的可观测快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub pool: String,
    pub pending: usize,
    pub running: usize,
    pub idle: usize,
    pub busy: usize,
    pub terminating: usize,
    pub dead: usize,
    pub queued_tasks: usize,
    pub in_flight_tasks: usize,
    pub degraded: bool,
}

impl PoolStats {
    pub fn live_workers(&self) -> usize {
        self.pending + self.running + self.idle + self.busy + self.terminating
    }
}
