use std::sync::Arc;

use async_trait::async_trait;
use batchpool_domain::{BatchScheduler, GeneratedScript, JobId, JobState, WorkerPoolConfig};
use batchpool_errors::{SchedulerError, SchedulerResult};
use tracing::debug;

use super::{field_value, output_mentions};
use crate::command::{CommandRequest, CommandRunner};
use crate::script::{job_name, ScriptDialect};

const DIALECT: ScriptDialect = ScriptDialect {
    directive_prefix: "#PBS",
    reserved_flags: &[
        "-N",
        "-l select",
        "-l nodes",
        "-l ncpus",
        "-l mem",
        "-l ngpus",
        "-l walltime",
        "-q",
        "-A",
    ],
};

const GONE_MARKERS: &[&str] = &["Unknown Job Id", "Job has finished", "job has finished"];

/// PBS Pro / OpenPBS / Torque 适配
pub struct PbsScheduler {
    runner: Arc<dyn CommandRunner>,
}

impl PbsScheduler {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn directives(pool: &WorkerPoolConfig, worker_id: &str) -> Vec<String> {
        let resources = &pool.resources;
        let mut select = format!(
            "select=1:ncpus={}:mem={}mb",
            resources.cpus,
            resources.memory_mb()
        );
        if resources.gpus > 0 {
            select.push_str(&format!(":ngpus={}", resources.gpus));
        }

        let mut directives = vec![format!("-N {}", job_name(worker_id)), format!("-l {select}")];
        if let Some(walltime) = &resources.walltime {
            directives.push(format!("-l walltime={walltime}"));
        }
        if let Some(queue) = &resources.queue {
            directives.push(format!("-q {queue}"));
        }
        if let Some(account) = &resources.account {
            directives.push(format!("-A {account}"));
        }
        directives
    }

    /// 解析 `qstat -x -f` 的输出
    fn parse_status(text: &str) -> JobState {
        let Some(state) = field_value(text, "job_state") else {
            return JobState::Unknown;
        };
        match state {
            "Q" | "H" | "W" | "T" | "S" | "U" => JobState::Queued,
            "R" | "E" | "B" => JobState::Running,
            "X" => JobState::Completed,
            "F" | "C" => match field_value(text, "Exit_status").or_else(|| field_value(text, "exit_status")) {
                Some("0") => JobState::Completed,
                Some(_) => JobState::Failed,
                None => JobState::Unknown,
            },
            _ => JobState::Unknown,
        }
    }
}

#[async_trait]
impl BatchScheduler for PbsScheduler {
    fn name(&self) -> &str {
        "pbs"
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

    async fn submit(&self, pool: &str, script: &GeneratedScript) -> SchedulerResult<JobId> {
        let output = self
            .runner
            .run(CommandRequest::new("qsub").stdin(script.text.clone()))
            .await
            .map_err(|e| SchedulerError::submission(pool, e.to_string()))?;

        if !output.is_success() {
            return Err(SchedulerError::submission(pool, output.error_message()));
        }

        // 输出形如 "1234.pbs-server"
        let job_id = output
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(JobId::new)
            .ok_or_else(|| SchedulerError::submission(pool, "qsub没有返回作业ID"))?;
        debug!("PBS作业已提交: {}", job_id);
        Ok(job_id)
    }

    async fn poll(&self, job_id: &JobId) -> SchedulerResult<JobState> {
        let output = self
            .runner
            .run(
                CommandRequest::new("qstat")
                    .args(["-x", "-f"])
                    .arg(job_id.as_str()),
            )
            .await?;

        if output.is_success() {
            return Ok(Self::parse_status(&output.stdout));
        }
        if output_mentions(&output, GONE_MARKERS) {
            return Ok(JobState::Unknown);
        }
        Err(SchedulerError::command_failed("qstat", output.error_message()))
    }

    async fn cancel(&self, job_id: &JobId) -> SchedulerResult<()> {
        let output = self
            .runner
            .run(CommandRequest::new("qdel").arg(job_id.as_str()))
            .await?;

        if output.is_success()
            || output_mentions(&output, GONE_MARKERS)
            || output_mentions(&output, &["invalid state for job"])
        {
            return Ok(());
        }
        Err(SchedulerError::command_failed("qdel", output.error_message()))
    }
}
