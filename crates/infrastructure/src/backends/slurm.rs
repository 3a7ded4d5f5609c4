use std::sync::Arc;

use async_trait::async_trait;
use batchpool_domain::{BatchScheduler, GeneratedScript, JobId, JobState, WorkerPoolConfig};
use batchpool_errors::{SchedulerError, SchedulerResult};
use tracing::{debug, instrument, warn};

use super::output_mentions;
use crate::command::{CommandRequest, CommandRunner};
use crate::script::{job_name, ScriptDialect};

const DIALECT: ScriptDialect = ScriptDialect {
    directive_prefix: "#SBATCH",
    reserved_flags: &[
        "--job-name",
        "-J",
        "--ntasks",
        "-n",
        "--cpus-per-task",
        "-c",
        "--mem",
        "--mem-per-cpu",
        "--gres",
        "--gpus",
        "-G",
        "--time",
        "-t",
        "--partition",
        "-p",
        "--account",
        "-A",
    ],
};

/// squeue/scancel 对已不存在作业的提示
const GONE_MARKERS: &[&str] = &[
    "Invalid job id specified",
    "Job/step already completing or completed",
];

pub struct SlurmScheduler {
    runner: Arc<dyn CommandRunner>,
}

impl SlurmScheduler {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn directives(pool: &WorkerPoolConfig, worker_id: &str) -> Vec<String> {
        let resources = &pool.resources;
        let mut directives = vec![
            format!("--job-name={}", job_name(worker_id)),
            "--ntasks=1".to_string(),
            format!("--cpus-per-task={}", resources.cpus),
            format!("--mem={}M", resources.memory_mb()),
        ];
        if resources.gpus > 0 {
            directives.push(format!("--gres=gpu:{}", resources.gpus));
        }
        if let Some(walltime) = &resources.walltime {
            directives.push(format!("--time={walltime}"));
        }
        if let Some(queue) = &resources.queue {
            directives.push(format!("--partition={queue}"));
        }
        if let Some(account) = &resources.account {
            directives.push(format!("--account={account}"));
        }
        directives
    }

    /// `sbatch --parsable` 输出 `jobid` 或 `jobid;cluster`
    fn parse_submit_output(stdout: &str) -> Option<JobId> {
        let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
        let id = line.split(';').next()?.trim();
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit() || c == '_') {
            return None;
        }
        Some(JobId::new(id))
    }

    pub(crate) fn parse_state(state: &str) -> JobState {
        // sacct 会输出 "CANCELLED by 1000"
        let state = state.split_whitespace().next().unwrap_or("");
        match state.trim_end_matches('+') {
            "PENDING" | "CONFIGURING" | "REQUEUED" | "REQUEUE_HOLD" | "REQUEUE_FED"
            | "RESV_DEL_HOLD" | "SUSPENDED" | "STOPPED" => JobState::Queued,
            "RUNNING" | "COMPLETING" | "SIGNALING" | "STAGE_OUT" | "RESIZING" => {
                JobState::Running
            }
            "COMPLETED" => JobState::Completed,
            "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED"
            | "BOOT_FAIL" | "DEADLINE" | "REVOKED" | "SPECIAL_EXIT" => JobState::Failed,
            _ => JobState::Unknown,
        }
    }

    async fn poll_accounting(&self, job_id: &JobId) -> SchedulerResult<JobState> {
        let output = self
            .runner
            .run(
                CommandRequest::new("sacct")
                    .args(["-n", "-X", "-P", "-o", "State", "-j"])
                    .arg(job_id.as_str()),
            )
            .await?;

        if !output.is_success() {
            // 未启用记账时sacct不可用，只能判定为未知
            warn!("sacct查询作业 {} 失败: {}", job_id, output.error_message());
            return Ok(JobState::Unknown);
        }

        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(Self::parse_state)
            .unwrap_or(JobState::Unknown))
    }
}

#[async_trait]
impl BatchScheduler for SlurmScheduler {
    fn name(&self) -> &str {
        "slurm"
    }

    fn validate_pool(&self, pool: &WorkerPoolConfig) -> SchedulerResult<()> {
        DIALECT.validate_pool(pool)
    }

    fn render_script(
        &self,
        pool: &WorkerPoolConfig,
        worker_id: &str,
    ) -> SchedulerResult<GeneratedScript> {
        Ok(DIALECT.render(pool, worker_id, Self::directives(pool, worker_id)))
    }

    #[instrument(skip(self, script), fields(job_name = %script.job_name))]
    async fn submit(&self, pool: &str, script: &GeneratedScript) -> SchedulerResult<JobId> {
        let output = self
            .runner
            .run(
                CommandRequest::new("sbatch")
                    .arg("--parsable")
                    .stdin(script.text.clone()),
            )
            .await
            .map_err(|e| SchedulerError::submission(pool, e.to_string()))?;

        if !output.is_success() {
            return Err(SchedulerError::submission(pool, output.error_message()));
        }

        let job_id = Self::parse_submit_output(&output.stdout).ok_or_else(|| {
            SchedulerError::submission(
                pool,
                format!("无法解析sbatch输出: {}", output.stdout.trim()),
            )
        })?;
        debug!("Slurm作业已提交: {}", job_id);
        Ok(job_id)
    }

    async fn poll(&self, job_id: &JobId) -> SchedulerResult<JobState> {
        let output = self
            .runner
            .run(
                CommandRequest::new("squeue")
                    .args(["-h", "-o", "%T", "-j"])
                    .arg(job_id.as_str()),
            )
            .await?;

        if output.is_success() {
            if let Some(state) = output.stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
                return Ok(Self::parse_state(state));
            }
        } else if !output_mentions(&output, GONE_MARKERS) {
            return Err(SchedulerError::command_failed(
                "squeue",
                output.error_message(),
            ));
        }

        // 作业已离开队列，从记账数据获取最终状态
        self.poll_accounting(job_id).await
    }

    async fn cancel(&self, job_id: &JobId) -> SchedulerResult<()> {
        let output = self
            .runner
            .run(CommandRequest::new("scancel").arg(job_id.as_str()))
            .await?;

        if output.is_success() || output_mentions(&output, GONE_MARKERS) {
            return Ok(());
        }
        Err(SchedulerError::command_failed(
            "scancel",
            output.error_message(),
        ))
    }
}
