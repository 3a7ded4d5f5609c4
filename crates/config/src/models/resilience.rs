use crate::validation::{ConfigValidator, ValidationUtils};
use serde::{Deserialize, Serialize};

/// 作业提交与状态查询的退避重试配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// 单个Worker作业的最大提交尝试次数，用尽后池被标记为降级
    pub submit_max_attempts: u32,
    /// 基础重试间隔（毫秒）
    pub base_interval_ms: u64,
    /// 最大重试间隔（毫秒）
    pub max_interval_ms: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            submit_max_attempts: 4,
            base_interval_ms: 1000,
            max_interval_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl ConfigValidator for RetryConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        ValidationUtils::validate_count(
            self.submit_max_attempts as usize,
            "retry.submit_max_attempts",
            100,
        )?;
        ValidationUtils::validate_interval_ms(self.base_interval_ms, "retry.base_interval_ms")?;
        ValidationUtils::validate_interval_ms(self.max_interval_ms, "retry.max_interval_ms")?;

        if self.base_interval_ms > self.max_interval_ms {
            return Err(crate::ConfigError::Validation(
                "retry.base_interval_ms must not exceed retry.max_interval_ms".to_string(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(crate::ConfigError::Validation(
                "retry.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        ValidationUtils::validate_ratio(self.jitter_factor, "retry.jitter_factor")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_validation() {
        let config = RetryConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid = config.clone();
        invalid.submit_max_attempts = 0;
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.base_interval_ms = 120_000;
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.backoff_multiplier = 0.5;
        assert!(invalid.validate().is_err());

        let mut invalid = config.clone();
        invalid.jitter_factor = 2.0;
        assert!(invalid.validate().is_err());
    }
}
