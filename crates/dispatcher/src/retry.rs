use std::time::Duration;

use batchpool_config::RetryConfig;

/// 指数退避，带上限和随机抖动
#[derive(Debug, Clone)]
pub struct Backoff {
    base_interval_ms: u64,
    max_interval_ms: u64,
    multiplier: f64,
    jitter_factor: f64,
    max_attempts: u32,
}

impl Backoff {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_interval_ms: config.base_interval_ms,
            max_interval_ms: config.max_interval_ms,
            multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
            max_attempts: config.submit_max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 第 `attempt` 次失败（从0开始）之后的等待时间
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_interval = self.base_interval_ms as f64;
        let max_interval = self.max_interval_ms as f64;

        // 计算指数退避间隔
        let exponential_interval = base_interval * self.multiplier.powi(attempt as i32);

        // 限制最大间隔
        let capped_interval = exponential_interval.min(max_interval);

        // 添加随机抖动以避免大量Worker同时重试
        let jitter = capped_interval * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let final_interval = (capped_interval + jitter).max(base_interval).min(max_interval);

        Duration::from_millis(final_interval as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
