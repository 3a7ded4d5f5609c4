//! 各批处理调度器的适配实现

mod local;
mod lsf;
mod pbs;
mod sge;
mod slurm;

pub use local::LocalScheduler;
pub use lsf::LsfScheduler;
pub use pbs::PbsScheduler;
pub use sge::SgeScheduler;
pub use slurm::SlurmScheduler;

use crate::command::CommandOutput;

/// 命令输出中是否包含任一提示
fn output_mentions(output: &CommandOutput, markers: &[&str]) -> bool {
    let combined = output.combined();
    markers.iter().any(|marker| combined.contains(marker))
}

/// `key = value` 形式输出（qstat -f、qacct）中取某个字段
fn field_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines().find_map(|line| {
        let line = line.trim();
        let rest = line.strip_prefix(key)?;
        // 防止 "exit_status" 匹配到 "exit_status_extra"
        if !rest.starts_with(|c: char| c.is_whitespace() || c == '=' || c == ':') {
            return None;
        }
        let value = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '=' || c == ':');
        Some(value.trim())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_value() {
        let text = "Job Id: 1.server\n    job_state = F\n    Exit_status = 0\n";
        assert_eq!(field_value(text, "job_state"), Some("F"));
        assert_eq!(field_value(text, "Exit_status"), Some("0"));
        assert_eq!(field_value(text, "Exit"), None);
        assert_eq!(field_value(text, "queue"), None);

        let qacct = "qname        all.q\nexit_status  137\nfailed       0\n";
        assert_eq!(field_value(qacct, "exit_status"), Some("137"));
        assert_eq!(field_value(qacct, "failed"), Some("0"));
    }

    #[test]
    fn test_output_mentions() {
        let output = CommandOutput::failure(153, "qdel: Unknown Job Id 12.server");
        assert!(output_mentions(&output, &["Unknown Job Id"]));
        assert!(!output_mentions(&output, &["not found"]));
    }
}
