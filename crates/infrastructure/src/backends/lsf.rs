use std::sync::Arc;

use async_trait::async_trait;
use batchpool_domain::{BatchScheduler, GeneratedScript, JobId, JobState, WorkerPoolConfig};
use batchpool_errors::{SchedulerError, SchedulerResult};
use tracing::debug;

use super::output_mentions;
use crate::command::{CommandRequest, CommandRunner};
use crate::script::{job_name, ScriptDialect};

const DIALECT: ScriptDialect = ScriptDialect {
    directive_prefix: "#BSUB",
    reserved_flags: &["-J", "-n", "-M", "-R", "-gpu", "-W", "-q", "-P"],
};

const GONE_MARKERS: &[&str] = &["is not found", "Job has already finished"];

/// IBM Spectrum LSF 适配
pub struct LsfScheduler {
    runner: Arc<dyn CommandRunner>,
}

impl LsfScheduler {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn directives(pool: &WorkerPoolConfig, worker_id: &str) -> Vec<String> {
        let resources = &pool.resources;
        let memory_mb = resources.memory_mb();
        let mut directives = vec![
            format!("-J {}", job_name(worker_id)),
            format!("-n {}", resources.cpus),
            format!("-R \"span[hosts=1] rusage[mem={memory_mb}MB]\""),
            format!("-M {memory_mb}MB"),
        ];
        if resources.gpus > 0 {
            directives.push(format!("-gpu \"num={}\"", resources.gpus));
        }
        if let Some(walltime) = &resources.walltime {
            directives.push(format!("-W {walltime}"));
        }
        if let Some(queue) = &resources.queue {
            directives.push(format!("-q {queue}"));
        }
        if let Some(account) = &resources.account {
            directives.push(format!("-P {account}"));
        }
        directives
    }

    /// `Job <1234> is submitted to queue <normal>.`
    fn parse_submit_output(stdout: &str) -> Option<JobId> {
        let start = stdout.find("Job <")? + "Job <".len();
        let end = stdout[start..].find('>')? + start;
        let id = &stdout[start..end];
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        Some(JobId::new(id))
    }

    fn parse_state(stat: &str) -> JobState {
        match stat.trim() {
            "PEND" | "PSUSP" | "USUSP" | "SSUSP" | "WAIT" => JobState::Queued,
            "RUN" | "PROV" => JobState::Running,
            "DONE" => JobState::Completed,
            "EXIT" | "ZOMBI" => JobState::Failed,
            _ => JobState::Unknown,
        }
    }
}

#[async_trait]
impl BatchScheduler for LsfScheduler {
    fn name(&self) -> &str {
        "lsf"
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
            .run(CommandRequest::new("bsub").stdin(script.text.clone()))
            .await
            .map_err(|e| SchedulerError::submission(pool, e.to_string()))?;

        if !output.is_success() {
            return Err(SchedulerError::submission(pool, output.error_message()));
        }

        let job_id = Self::parse_submit_output(&output.stdout).ok_or_else(|| {
            SchedulerError::submission(pool, format!("无法解析bsub输出: {}", output.stdout.trim()))
        })?;
        debug!("LSF作业已提交: {}", job_id);
        Ok(job_id)
    }

    async fn poll(&self, job_id: &JobId) -> SchedulerResult<JobState> {
        let output = self
            .runner
            .run(
                CommandRequest::new("bjobs")
                    .args(["-noheader", "-o", "stat"])
                    .arg(job_id.as_str()),
            )
            .await?;

        // bjobs 对不存在的作业可能返回0并把提示写到stdout
        if output_mentions(&output, GONE_MARKERS) {
            return Ok(JobState::Unknown);
        }
        if !output.is_success() {
            return Err(SchedulerError::command_failed("bjobs", output.error_message()));
        }

        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(Self::parse_state)
            .unwrap_or(JobState::Unknown))
    }

    async fn cancel(&self, job_id: &JobId) -> SchedulerResult<()> {
        let output = self
            .runner
            .run(CommandRequest::new("bkill").arg(job_id.as_str()))
            .await?;

        if output.is_success() || output_mentions(&output, GONE_MARKERS) {
            return Ok(());
        }
        Err(SchedulerError::command_failed("bkill", output.error_message()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, MockCommandRunner};
    use batchpool_domain::ResourceSpec;

    #[test]
    fn test_render_script() {
        let mut resources = ResourceSpec::new(4, 2.0);
        resources.gpus = 1;
        resources.queue = Some("gpu".to_string());
        let pool = WorkerPoolConfig::new("gpu", resources, 1);

        let lsf = LsfScheduler::new(Arc::new(MockCommandRunner::new()));
        let script = lsf.render_script(&pool, "gpu-w1").unwrap();
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(
            &lines[..7],
            &[
                "#!/bin/bash",
                "#BSUB -J batchpool-gpu-w1",
                "#BSUB -n 4",
                "#BSUB -R \"span[hosts=1] rusage[mem=2048MB]\"",
                "#BSUB -M 2048MB",
                "#BSUB -gpu \"num=1\"",
                "#BSUB -q gpu",
            ]
        );
    }

    #[test]
    fn test_parse_submit_output() {
        assert_eq!(
            LsfScheduler::parse_submit_output("Job <8812> is submitted to queue <normal>.\n"),
            Some(JobId::new("8812"))
        );
        assert_eq!(LsfScheduler::parse_submit_output("Request aborted"), None);
    }

    #[test]
    fn test_parse_state() {
        assert_eq!(LsfScheduler::parse_state("PEND"), JobState::Queued);
        assert_eq!(LsfScheduler::parse_state("RUN"), JobState::Running);
        assert_eq!(LsfScheduler::parse_state("DONE"), JobState::Completed);
        assert_eq!(LsfScheduler::parse_state("EXIT"), JobState::Failed);
        assert_eq!(LsfScheduler::parse_state("UNKWN"), JobState::Unknown);
    }

    #[tokio::test]
    async fn test_poll_missing_job() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .withf(|req| req.program == "bjobs")
            .returning(|_| Ok(CommandOutput::failure(255, "Job <77> is not found")));

        let lsf = LsfScheduler::new(Arc::new(mock));
        assert_eq!(lsf.poll(&JobId::new("77")).await.unwrap(), JobState::Unknown);
    }

    #[tokio::test]
    async fn test_cancel_finished_job() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .withf(|req| req.program == "bkill" && req.args == vec!["77"])
            .times(1)
            .returning(|_| Ok(CommandOutput::failure(255, "Job <77>: Job has already finished")));

        let lsf = LsfScheduler::new(Arc::new(mock));
        assert!(lsf.cancel(&JobId::new("77")).await.is_ok());
    }
}
