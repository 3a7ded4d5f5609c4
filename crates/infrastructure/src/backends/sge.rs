use std::sync::Arc;

use async_trait::async_trait;
use batchpool_domain::{BatchScheduler, GeneratedScript, JobId, JobState, WorkerPoolConfig};
use batchpool_errors::{SchedulerError, SchedulerResult};
use tracing::debug;

use super::{field_value, output_mentions};
use crate::command::{CommandRequest, CommandRunner};
use crate::script::{job_name, ScriptDialect};

const DIALECT: ScriptDialect = ScriptDialect {
    directive_prefix: "#$",
    reserved_flags: &[
        "-N", "-pe", "-l h_vmem", "-l mem_free", "-l gpu", "-l h_rt", "-q", "-P", "-S",
    ],
};

const GONE_MARKERS: &[&str] = &["do not exist", "does not exist", "not found"];

/// Son of Grid Engine / Univa 适配
pub struct SgeScheduler {
    runner: Arc<dyn CommandRunner>,
    parallel_env: String,
}

impl SgeScheduler {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            parallel_env: "smp".to_string(),
        }
    }

    fn directives(&self, pool: &WorkerPoolConfig, worker_id: &str) -> Vec<String> {
        let resources = &pool.resources;
        // h_vmem 按slot计算
        let per_slot_mb = resources.memory_mb().div_ceil(u64::from(resources.cpus.max(1)));

        let mut directives = vec![
            format!("-N {}", job_name(worker_id)),
            "-S /bin/bash".to_string(),
            format!("-pe {} {}", self.parallel_env, resources.cpus),
            format!("-l h_vmem={per_slot_mb}M"),
        ];
        if resources.gpus > 0 {
            directives.push(format!("-l gpu={}", resources.gpus));
        }
        if let Some(walltime) = &resources.walltime {
            directives.push(format!("-l h_rt={walltime}"));
        }
        if let Some(queue) = &resources.queue {
            directives.push(format!("-q {queue}"));
        }
        if let Some(account) = &resources.account {
            directives.push(format!("-P {account}"));
        }
        directives
    }

    /// qstat的状态码，如 `qw`、`r`、`Eqw`
    fn parse_state_code(code: &str) -> JobState {
        if code.contains('E') {
            JobState::Failed
        } else if code.contains('r') || code.contains('t') {
            JobState::Running
        } else if code.contains('q') || code.contains('h') || code.contains('w') || code.contains('s') || code.contains('S') {
            JobState::Queued
        } else {
            JobState::Unknown
        }
    }

    /// `qstat -j` 较新版本输出 `job_state 1: r`，未出现时作业仍在等待
    fn parse_job_info(text: &str) -> JobState {
        match field_value(text, "job_state") {
            Some(value) => {
                let code = value.rsplit(':').next().unwrap_or(value).trim();
                Self::parse_state_code(code)
            }
            None => JobState::Queued,
        }
    }

    /// 基于 `qacct -j` 判断作业最终结果
    fn parse_accounting(text: &str) -> JobState {
        let failed = field_value(text, "failed").map(|v| v.split_whitespace().next() != Some("0"));
        let exit = field_value(text, "exit_status").map(|v| v.split_whitespace().next() != Some("0"));
        match (failed, exit) {
            (None, None) => JobState::Unknown,
            (Some(true), _) | (_, Some(true)) => JobState::Failed,
            _ => JobState::Completed,
        }
    }
}

#[async_trait]
impl BatchScheduler for SgeScheduler {
    fn name(&self) -> &str {
        "sge"
    }

    fn validate_pool(&self, pool: &WorkerPoolConfig) -> SchedulerResult<()> {
        DIALECT.validate_pool(pool)
    }

    fn render_script(
        &self,
        pool: &WorkerPoolConfig,
        worker_id: &str,
    ) -> SchedulerResult<GeneratedScript> {
        Ok(DIALECT.render(pool, worker_id, self.directives(pool, worker_id)))
    }

    async fn submit(&self, pool: &str, script: &GeneratedScript) -> SchedulerResult<JobId> {
        let output = self
            .runner
            .run(
                CommandRequest::new("qsub")
                    .arg("-terse")
                    .stdin(script.text.clone()),
            )
            .await
            .map_err(|e| SchedulerError::submission(pool, e.to_string()))?;

        if !output.is_success() {
            return Err(SchedulerError::submission(pool, output.error_message()));
        }

        // 数组作业输出 "1234.1-10:1"
        let job_id = output
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .and_then(|l| l.split('.').next())
            .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
            .map(JobId::new)
            .ok_or_else(|| {
                SchedulerError::submission(
                    pool,
                    format!("无法解析qsub输出: {}", output.stdout.trim()),
                )
            })?;
        debug!("SGE作业已提交: {}", job_id);
        Ok(job_id)
    }

    async fn poll(&self, job_id: &JobId) -> SchedulerResult<JobState> {
        let output = self
            .runner
            .run(CommandRequest::new("qstat").arg("-j").arg(job_id.as_str()))
            .await?;

        if output.is_success() {
            return Ok(Self::parse_job_info(&output.stdout));
        }
        if !output_mentions(&output, GONE_MARKERS) {
            return Err(SchedulerError::command_failed("qstat", output.error_message()));
        }

        let accounting = self
            .runner
            .run(CommandRequest::new("qacct").arg("-j").arg(job_id.as_str()))
            .await?;
        if !accounting.is_success() {
            return Ok(JobState::Unknown);
        }
        Ok(Self::parse_accounting(&accounting.stdout))
    }

    async fn cancel(&self, job_id: &JobId) -> SchedulerResult<()> {
        let output = self
            .runner
            .run(CommandRequest::new("qdel").arg(job_id.as_str()))
            .await?;

        if output.is_success() || output_mentions(&output, GONE_MARKERS) {
            return Ok(());
        }
        Err(SchedulerError::command_failed("qdel", output.error_message()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, MockCommandRunner};
    use batchpool_domain::ResourceSpec;

    #[test]
    fn test_render_script() {
        let pool = WorkerPoolConfig::new("small", ResourceSpec::new(2, 3.0), 2);
        let sge = SgeScheduler::new(Arc::new(MockCommandRunner::new()));
        let script = sge.render_script(&pool, "small-w1").unwrap();
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(
            &lines[..5],
            &[
                "#!/bin/bash",
                "#$ -N batchpool-small-w1",
                "#$ -S /bin/bash",
                "#$ -pe smp 2",
                "#$ -l h_vmem=1536M",
            ]
        );
    }

    #[test]
    fn test_parse_state_code() {
        assert_eq!(SgeScheduler::parse_state_code("qw"), JobState::Queued);
        assert_eq!(SgeScheduler::parse_state_code("hqw"), JobState::Queued);
        assert_eq!(SgeScheduler::parse_state_code("r"), JobState::Running);
        assert_eq!(SgeScheduler::parse_state_code("t"), JobState::Running);
        assert_eq!(SgeScheduler::parse_state_code("Eqw"), JobState::Failed);
        assert_eq!(SgeScheduler::parse_state_code(""), JobState::Unknown);
    }

    #[test]
    fn test_parse_accounting() {
        let ok = "qname   all.q\nfailed       0\nexit_status  0\n";
        assert_eq!(SgeScheduler::parse_accounting(ok), JobState::Completed);

        let killed = "failed       100 : assumedly after job\nexit_status  137\n";
        assert_eq!(SgeScheduler::parse_accounting(killed), JobState::Failed);

        assert_eq!(SgeScheduler::parse_accounting(""), JobState::Unknown);
    }

    #[tokio::test]
    async fn test_submit_terse() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .withf(|req| req.program == "qsub" && req.args == vec!["-terse"])
            .returning(|_| Ok(CommandOutput::success("5678\n")));

        let sge = SgeScheduler::new(Arc::new(mock));
        let script = GeneratedScript {
            job_name: "j".to_string(),
            text: "#!/bin/bash\n".to_string(),
        };
        assert_eq!(sge.submit("small", &script).await.unwrap(), JobId::new("5678"));
    }

    #[tokio::test]
    async fn test_poll_running_and_finished() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .withf(|req| req.program == "qstat" && req.args[1] == "1")
            .returning(|_| Ok(CommandOutput::success("job_number: 1\njob_state 1: r\n")));
        mock.expect_run()
            .withf(|req| req.program == "qstat" && req.args[1] == "2")
            .returning(|_| {
                Ok(CommandOutput::failure(
                    1,
                    "Following jobs do not exist or permissions are not sufficient:\n2",
                ))
            });
        mock.expect_run()
            .withf(|req| req.program == "qacct")
            .returning(|_| Ok(CommandOutput::success("failed 0\nexit_status 0\n")));

        let sge = SgeScheduler::new(Arc::new(mock));
        assert_eq!(sge.poll(&JobId::new("1")).await.unwrap(), JobState::Running);
        assert_eq!(sge.poll(&JobId::new("2")).await.unwrap(), JobState::Completed);
    }
}
