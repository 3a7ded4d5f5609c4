//! 外部命令执行
//!
//! 所有调度器命令（sbatch、qstat、bkill ...）以及作业步都通过 [`CommandRunner`]
//! 执行，测试中可以替换为mock。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use batchpool_errors::{SchedulerError, SchedulerResult};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

/// 一次命令调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    /// 为空时使用执行器的默认超时
    pub timeout: Option<Duration>,
}

impl CommandRequest {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout: None,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin<S: Into<String>>(mut self, input: S) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// 用于日志和错误信息的命令行
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// 被信号终止时为空
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success<S: Into<String>>(stdout: S) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure<S: Into<String>>(status: i32, stderr: S) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout与stderr合并，便于匹配调度器的错误提示
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }

    /// 错误信息：优先取stderr
    pub fn error_message(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.status {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// 运行命令直到结束。无法启动或超时返回错误，非零退出码不算错误。
    async fn run(&self, request: CommandRequest) -> SchedulerResult<CommandOutput>;
}

/// 基于 `tokio::process` 的命令执行器
#[derive(Debug, Clone, Default)]
pub struct TokioCommandRunner {
    default_timeout: Option<Duration>,
}

impl TokioCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            default_timeout: Some(timeout),
        }
    }
}

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    #[instrument(skip(self, request), fields(command = %request.program))]
    async fn run(&self, request: CommandRequest) -> SchedulerResult<CommandOutput> {
        let cmd_display = request.display();
        debug!("执行命令: {}", cmd_display);

        let mut command = Command::new(&request.program);
        command
            .args(&request.args)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // 超时或调用方放弃等待时结束子进程
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| SchedulerError::command_failed(&cmd_display, format!("无法启动: {e}")))?;

        if let Some(input) = &request.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await.map_err(|e| {
                    SchedulerError::command_failed(&cmd_display, format!("写入stdin失败: {e}"))
                })?;
                // 关闭stdin，sbatch/qsub才会开始读取脚本
                drop(stdin);
            }
        }

        let wait = child.wait_with_output();
        let output = match request.timeout.or(self.default_timeout) {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                SchedulerError::Timeout(format!("命令 {cmd_display} 超过 {}s 未结束", limit.as_secs()))
            })?,
            None => wait.await,
        }
        .map_err(|e| SchedulerError::command_failed(&cmd_display, e.to_string()))?;

        let result = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!("命令结束: {} 状态: {:?}", cmd_display, result.status);
        Ok(result)
    }
}
