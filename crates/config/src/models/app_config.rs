use anyhow::{Context, Result};
use batchpool_domain::{ResourceSpec, WorkerPoolConfig};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    dispatcher::{DispatcherConfig, PollerConfig},
    logging::ObservabilityConfig,
    pools::validate_pools,
    resilience::RetryConfig,
    scheduler::SchedulerConfig,
};
use crate::validation::ConfigValidator;

/// 环境变量前缀，例如 `BATCHPOOL_DISPATCHER__MAX_TASK_RETRIES=3`
pub const ENV_PREFIX: &str = "BATCHPOOL";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub dispatcher: DispatcherConfig,
    pub poller: PollerConfig,
    pub retry: RetryConfig,
    pub observability: ObservabilityConfig,
    pub default_pool: Option<String>,
    pub pools: Vec<WorkerPoolConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            dispatcher: DispatcherConfig::default(),
            poller: PollerConfig::default(),
            retry: RetryConfig::default(),
            observability: ObservabilityConfig::default(),
            default_pool: None,
            pools: vec![WorkerPoolConfig::new(
                "default",
                ResourceSpec::new(1, 1.0),
                4,
            )],
        }
    }
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/batchpool.toml",
                "batchpool.toml",
                "/etc/batchpool/config.toml",
            ];

            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn pool(&self, name: &str) -> Option<&WorkerPoolConfig> {
        self.pools.iter().find(|p| p.name == name)
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> crate::ConfigResult<()> {
        self.scheduler.validate()?;
        self.dispatcher.validate()?;
        self.poller.validate()?;
        self.retry.validate()?;
        self.observability.validate()?;
        validate_pools(&self.pools, self.default_pool.as_deref())?;
        Ok(())
    }
}
