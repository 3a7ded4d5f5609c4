//! Worker作业脚本的生成与校验，各后端只提供指令前缀和指令参数

use batchpool_domain::{GeneratedScript, WorkerPoolConfig};
use batchpool_errors::{SchedulerError, SchedulerResult};

/// Worker进程可见的环境变量
pub const WORKER_ID_ENV: &str = "BATCHPOOL_WORKER_ID";
pub const POOL_ENV: &str = "BATCHPOOL_POOL";

/// 一种调度器脚本方言
#[derive(Debug, Clone, Copy)]
pub struct ScriptDialect {
    /// `#SBATCH`、`#PBS` ...
    pub directive_prefix: &'static str,
    /// 由生成指令占用、用户不能覆盖的参数。
    /// `"-l walltime"` 这样带资源名的项只匹配该资源。
    pub reserved_flags: &'static [&'static str],
}

impl ScriptDialect {
    fn is_directive(&self, line: &str) -> bool {
        let trimmed = line.trim_start();
        trimmed
            .strip_prefix(self.directive_prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
    }

    /// 指令行去掉前缀后的参数部分
    fn directive_body<'a>(&self, line: &'a str) -> &'a str {
        line.trim_start()
            .strip_prefix(self.directive_prefix)
            .unwrap_or(line)
            .trim()
    }

    /// 参数是否覆盖了某个保留参数，返回被覆盖的保留项
    pub fn reserved_conflict(&self, flags: &str) -> Option<&'static str> {
        let mut tokens = flags.split_whitespace();
        let first = tokens.next()?;
        let (flag, inline_value) = match first.split_once('=') {
            Some((flag, value)) => (flag, Some(value)),
            None => (first, None),
        };
        let value = inline_value.or_else(|| tokens.next()).unwrap_or("");

        self.reserved_flags.iter().copied().find(|reserved| {
            let mut parts = reserved.split_whitespace();
            let reserved_flag = parts.next().unwrap_or("");
            match parts.next() {
                None => flag == reserved_flag,
                Some(resource) => {
                    flag == reserved_flag
                        && value
                            .trim_matches('"')
                            .split([',', ':'])
                            .any(|item| item.split('=').next() == Some(resource))
                }
            }
        })
    }

    /// 在池构建时校验：额外参数和脚本行中的指令不得覆盖生成的指令，
    /// 且脚本行中的指令必须位于所有Shell命令之前
    pub fn validate_pool(&self, pool: &WorkerPoolConfig) -> SchedulerResult<()> {
        for flag in &pool.resources.extra_flags {
            if let Some(reserved) = self.reserved_conflict(flag) {
                return Err(SchedulerError::config_error(format!(
                    "池 {} 的 extra_flags '{}' 覆盖了生成的指令 {}",
                    pool.name, flag, reserved
                )));
            }
        }

        let mut first_command: Option<&str> = None;
        for line in &pool.script_lines {
            if self.is_directive(line) {
                if let Some(command) = first_command {
                    return Err(SchedulerError::config_error(format!(
                        "池 {} 的指令行 '{}' 出现在Shell命令 '{}' 之后",
                        pool.name, line, command
                    )));
                }
                if let Some(reserved) = self.reserved_conflict(self.directive_body(line)) {
                    return Err(SchedulerError::config_error(format!(
                        "池 {} 的脚本行 '{}' 覆盖了生成的指令 {}",
                        pool.name, line, reserved
                    )));
                }
                continue;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            first_command.get_or_insert(line.as_str());
        }

        // setup_lines 渲染在 script_lines 之后，其中的指令会被调度器忽略
        if let Some(line) = pool
            .resources
            .setup_lines
            .iter()
            .find(|line| self.is_directive(line))
        {
            return Err(SchedulerError::config_error(format!(
                "池 {} 的 setup_lines 包含指令行 '{}'，请改用 extra_flags 或 script_lines",
                pool.name, line
            )));
        }

        Ok(())
    }

    /// 按固定顺序生成脚本：shebang、资源指令、extra_flags、script_lines、
    /// setup_lines、Worker环境变量、启动命令
    pub fn render(
        &self,
        pool: &WorkerPoolConfig,
        worker_id: &str,
        directives: Vec<String>,
    ) -> GeneratedScript {
        let mut lines = vec!["#!/bin/bash".to_string()];
        lines.extend(
            directives
                .iter()
                .chain(pool.resources.extra_flags.iter())
                .map(|args| format!("{} {}", self.directive_prefix, args)),
        );
        lines.extend(pool.script_lines.iter().cloned());
        lines.extend(pool.resources.setup_lines.iter().cloned());
        lines.push(format!("export {WORKER_ID_ENV}={}", shell_quote(worker_id)));
        lines.push(format!("export {POOL_ENV}={}", shell_quote(&pool.name)));
        lines.push(pool.launch_command.clone());

        let mut text = lines.join("\n");
        text.push('\n');

        GeneratedScript {
            job_name: job_name(worker_id),
            text,
        }
    }
}

/// 作业名由Worker ID派生，便于在squeue/qstat中辨认
pub fn job_name(worker_id: &str) -> String {
    format!("batchpool-{worker_id}")
}

fn shell_quote(value: &str) -> String {
    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchpool_domain::ResourceSpec;

    const DIALECT: ScriptDialect = ScriptDialect {
        directive_prefix: "#PBS",
        reserved_flags: &["-N", "-q", "-l walltime", "-l select"],
    };

    fn pool() -> WorkerPoolConfig {
        WorkerPoolConfig::new("small", ResourceSpec::new(1, 1.0), 2)
    }

    #[test]
    fn test_reserved_conflict() {
        assert_eq!(DIALECT.reserved_conflict("-N other"), Some("-N"));
        assert_eq!(DIALECT.reserved_conflict("-l walltime=01:00:00"), Some("-l walltime"));
        assert_eq!(
            DIALECT.reserved_conflict("-l select=1:ncpus=4"),
            Some("-l select")
        );
        assert_eq!(DIALECT.reserved_conflict("-l place=scatter"), None);
        assert_eq!(DIALECT.reserved_conflict("-j oe"), None);
        assert_eq!(DIALECT.reserved_conflict(""), None);
    }

    #[test]
    fn test_render_order() {
        let mut pool = pool();
        pool.resources.extra_flags = vec!["-j oe".to_string()];
        pool.resources.setup_lines = vec!["module load python".to_string()];
        pool.script_lines = vec!["#PBS -m n".to_string(), "echo hello".to_string()];

        let script = DIALECT.render(&pool, "small-w1", vec!["-N batchpool-small-w1".to_string()]);
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(
            lines,
            vec![
                "#!/bin/bash",
                "#PBS -N batchpool-small-w1",
                "#PBS -j oe",
                "#PBS -m n",
                "echo hello",
                "module load python",
                "export BATCHPOOL_WORKER_ID=small-w1",
                "export BATCHPOOL_POOL=small",
                "exec sleep infinity",
            ]
        );
        assert_eq!(script.job_name, "batchpool-small-w1");
    }

    #[test]
    fn test_validate_directive_after_command() {
        let mut pool = pool();
        pool.script_lines = vec![
            "# comment".to_string(),
            "#PBS -m n".to_string(),
            "cd $HOME".to_string(),
            "#PBS -j oe".to_string(),
        ];
        let err = DIALECT.validate_pool(&pool).unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));
    }

    #[test]
    fn test_validate_reserved_override() {
        let mut pool = pool();
        pool.script_lines = vec!["#PBS -q debug".to_string()];
        assert!(DIALECT.validate_pool(&pool).is_err());

        let mut pool = self::pool();
        pool.resources.extra_flags = vec!["-l walltime=10:00:00".to_string()];
        assert!(DIALECT.validate_pool(&pool).is_err());

        let mut pool = self::pool();
        pool.resources.extra_flags = vec!["-j oe".to_string()];
        pool.script_lines = vec!["#PBS -m n".to_string(), "hostname".to_string()];
        assert!(DIALECT.validate_pool(&pool).is_ok());
    }

    #[test]
    fn test_validate_directive_in_setup_lines() {
        let mut pool = pool();
        pool.resources.setup_lines = vec![
            "module load python".to_string(),
            "#PBS -l walltime=01:00:00".to_string(),
        ];
        let err = DIALECT.validate_pool(&pool).unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));

        let mut pool = self::pool();
        pool.resources.setup_lines = vec!["# 加载环境".to_string(), "module load python".to_string()];
        assert!(DIALECT.validate_pool(&pool).is_ok());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("small-w1"), "small-w1");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
