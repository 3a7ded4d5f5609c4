use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use batchpool_domain::{Task, TaskExecutor, TaskResult, WorkerHandle};
use batchpool_errors::{SchedulerError, SchedulerResult};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::command::{CommandRequest, CommandRunner};

/// 作业步启动失败时调度器给出的提示，说明Worker所在作业已不存在
const WORKER_GONE_MARKERS: &[&str] = &[
    "Invalid job id specified",
    "Job/step already completing or completed",
    "Unable to create step for job",
    "Unknown Job Id",
    "Job has finished",
    "Job has already finished",
];

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TaskPayload {
    Shell(String),
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// 在Worker作业的资源分配内以作业步方式运行任务
///
/// 模板中的 `{job_id}`、`{worker_id}`、`{pool}` 会被替换，之后追加任务命令。
/// 模板为空时任务直接在本机运行。
pub struct StepExecutor {
    runner: Arc<dyn CommandRunner>,
    template: Vec<String>,
}

impl StepExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, template: Vec<String>) -> Self {
        Self { runner, template }
    }

    fn task_command(task: &Task, pool: &str) -> SchedulerResult<Vec<String>> {
        let payload: TaskPayload = serde_json::from_value(task.payload.clone()).map_err(|_| {
            SchedulerError::task_execution(
                &task.id,
                pool,
                "任务负载必须是命令字符串或 {\"command\": ..., \"args\": [...]}",
            )
        })?;

        let command = match payload {
            TaskPayload::Shell(script) => vec!["/bin/sh".to_string(), "-c".to_string(), script],
            TaskPayload::Command { command, args } => {
                std::iter::once(command).chain(args).collect()
            }
        };
        if command.first().map_or(true, |c| c.trim().is_empty()) {
            return Err(SchedulerError::task_execution(&task.id, pool, "任务命令为空"));
        }
        Ok(command)
    }

    fn build_request(&self, worker: &WorkerHandle, task: &Task) -> SchedulerResult<CommandRequest> {
        let mut argv: Vec<String> = self
            .template
            .iter()
            .map(|part| {
                part.replace("{job_id}", worker.job_id.as_str())
                    .replace("{worker_id}", &worker.worker_id)
                    .replace("{pool}", &worker.pool)
            })
            .collect();
        argv.extend(Self::task_command(task, &worker.pool)?);

        let mut parts = argv.into_iter();
        let program = parts
            .next()
            .ok_or_else(|| SchedulerError::task_execution(&task.id, &worker.pool, "任务命令为空"))?;
        Ok(CommandRequest::new(program).args(parts))
    }
}

#[async_trait]
impl TaskExecutor for StepExecutor {
    #[instrument(skip(self, worker, task), fields(task_id = %task.id, worker_id = %worker.worker_id))]
    async fn execute(&self, worker: &WorkerHandle, task: &Task) -> SchedulerResult<TaskResult> {
        let request = self.build_request(worker, task)?;
        debug!("在Worker {} 上执行任务 {}: {}", worker.worker_id, task.id, request.display());

        let started = Instant::now();
        let output = self.runner.run(request).await.map_err(|e| {
            SchedulerError::task_execution(&task.id, &worker.pool, e.to_string())
        })?;
        let duration_ms = started.elapsed().as_millis() as u64;

        if output.is_success() {
            return Ok(TaskResult {
                output: output.stdout,
                duration_ms,
            });
        }

        if !self.template.is_empty()
            && WORKER_GONE_MARKERS
                .iter()
                .any(|marker| output.stderr.contains(marker))
        {
            warn!(
                "任务 {} 的作业步无法在Worker {} 上启动: {}",
                task.id,
                worker.worker_id,
                output.error_message()
            );
            return Err(SchedulerError::WorkerLost {
                pool: worker.pool.clone(),
                worker_id: worker.worker_id.clone(),
                task_id: Some(task.id.clone()),
            });
        }

        Err(SchedulerError::task_execution(
            &task.id,
            &worker.pool,
            output.error_message(),
        ))
    }
}
