use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 分派循环在没有事件时的最长等待
    pub tick_interval_ms: u64,
    /// 单个任务在Worker上执行的最长时间，超时视为Worker丢失
    pub task_timeout_seconds: u64,
    /// Worker丢失后任务的最大重新分派次数
    pub max_task_retries: u32,
    /// 任务来源每批推送的最大任务数
    pub ready_batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 500,
            task_timeout_seconds: 3600,
            max_task_retries: 2,
            ready_batch_size: 64,
        }
    }
}

impl ConfigValidator for DispatcherConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_interval_ms(self.tick_interval_ms, "dispatcher.tick_interval_ms")?;
        ValidationUtils::validate_task_deadline_seconds(
            self.task_timeout_seconds,
            "dispatcher.task_timeout_seconds",
        )?;
        if self.max_task_retries > 100 {
            return Err(crate::ConfigError::Validation(
                "dispatcher.max_task_retries must be less than or equal to 100".to_string(),
            ));
        }
        ValidationUtils::validate_count(self.ready_batch_size, "dispatcher.ready_batch_size", 10000)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollerConfig {
    /// 每个池轮询作业状态的间隔
    pub interval_ms: u64,
    /// 连续多少次Unknown/查询失败后判定Worker丢失
    pub unknown_threshold: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5000,
            unknown_threshold: 3,
        }
    }
}

impl ConfigValidator for PollerConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_interval_ms(self.interval_ms, "poller.interval_ms")?;
        ValidationUtils::validate_count(
            self.unknown_threshold as usize,
            "poller.unknown_threshold",
            100,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatcher_config_validation() {
        let config = DispatcherConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid_config = config.clone();
        invalid_config.tick_interval_ms = 0;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = config.clone();
        invalid_config.task_timeout_seconds = 0;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = config.clone();
        invalid_config.max_task_retries = 101;
        assert!(invalid_config.validate().is_err());

        let mut invalid_config = config.clone();
        invalid_config.ready_batch_size = 0;
        assert!(invalid_config.validate().is_err());
    }

    #[test]
    fn test_poller_config_validation() {
        assert!(PollerConfig::default().validate().is_ok());

        let invalid = PollerConfig {
            unknown_threshold: 0,
            ..PollerConfig::default()
        };
        assert!(invalid.validate().is_err());

        let invalid = PollerConfig {
            interval_ms: 0,
            ..PollerConfig::default()
        };
        assert!(invalid.validate().is_err());
    }
}
