use std::collections::BTreeSet;

use batchpool_domain::{ResourceSpec, WorkerPoolConfig};

use crate::validation::{ConfigValidator, ValidationUtils};
use crate::{ConfigError, ConfigResult};

impl ConfigValidator for ResourceSpec {
    fn validate(&self) -> ConfigResult<()> {
        if self.cpus == 0 {
            return Err(ConfigError::Validation(
                "resources.cpus must be greater than 0".to_string(),
            ));
        }
        if !self.memory_gb.is_finite() || self.memory_gb <= 0.0 {
            return Err(ConfigError::Validation(
                "resources.memory_gb must be greater than 0".to_string(),
            ));
        }
        for (field, value) in [
            ("resources.walltime", &self.walltime),
            ("resources.queue", &self.queue),
            ("resources.account", &self.account),
        ] {
            if let Some(value) = value {
                ValidationUtils::validate_not_empty(value, field)?;
            }
        }
        for flag in &self.extra_flags {
            ValidationUtils::validate_not_empty(flag, "resources.extra_flags[]")?;
        }
        Ok(())
    }
}

impl ConfigValidator for WorkerPoolConfig {
    fn validate(&self) -> ConfigResult<()> {
        ValidationUtils::validate_not_empty(&self.name, "pools[].name")?;
        // 池名会出现在作业名和环境变量中
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::Validation(format!(
                "pool name '{}' may only contain ASCII letters, digits, '-' and '_'",
                self.name
            )));
        }

        self.resources
            .validate()
            .map_err(|e| ConfigError::Validation(format!("pool '{}': {e}", self.name)))?;

        ValidationUtils::validate_count(self.max_workers, "pools[].max_workers", 10000)?;
        if self.min_workers > self.max_workers {
            return Err(ConfigError::Validation(format!(
                "pool '{}': min_workers ({}) must not exceed max_workers ({})",
                self.name, self.min_workers, self.max_workers
            )));
        }
        ValidationUtils::validate_not_empty(&self.launch_command, "pools[].launch_command")?;
        if let Some(idle) = self.idle_timeout_seconds {
            ValidationUtils::validate_task_deadline_seconds(idle, "pools[].idle_timeout_seconds")?;
        }
        Ok(())
    }
}

/// 校验池列表：名称唯一、默认池存在
pub fn validate_pools(pools: &[WorkerPoolConfig], default_pool: Option<&str>) -> ConfigResult<()> {
    if pools.is_empty() {
        return Err(ConfigError::Validation(
            "at least one pool must be configured".to_string(),
        ));
    }

    let mut names = BTreeSet::new();
    for pool in pools {
        pool.validate()?;
        if !names.insert(pool.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate pool name: {}",
                pool.name
            )));
        }
    }

    if let Some(default) = default_pool {
        if !names.contains(default) {
            return Err(ConfigError::Validation(format!(
                "default_pool '{default}' does not name a configured pool"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(name: &str) -> WorkerPoolConfig {
        WorkerPoolConfig::new(name, ResourceSpec::new(1, 1.0), 2)
    }

    #[test]
    fn test_resource_spec_validation() {
        assert!(ResourceSpec::new(1, 0.5).validate().is_ok());
        assert!(ResourceSpec::new(0, 1.0).validate().is_err());
        assert!(ResourceSpec::new(1, 0.0).validate().is_err());

        let mut spec = ResourceSpec::new(1, 1.0);
        spec.queue = Some("  ".to_string());
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_pool_validation() {
        assert!(pool("small").validate().is_ok());
        assert!(pool("").validate().is_err());
        assert!(pool("bad name").validate().is_err());

        let mut p = pool("small");
        p.max_workers = 0;
        assert!(p.validate().is_err());

        let mut p = pool("small");
        p.min_workers = 3;
        assert!(p.validate().is_err());

        let mut p = pool("small");
        p.launch_command = String::new();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_validate_pools() {
        let pools = vec![pool("small"), pool("big")];
        assert!(validate_pools(&pools, None).is_ok());
        assert!(validate_pools(&pools, Some("big")).is_ok());
        assert!(validate_pools(&pools, Some("gpu")).is_err());
        assert!(validate_pools(&[], None).is_err());

        let duplicated = vec![pool("small"), pool("small")];
        let err = validate_pools(&duplicated, None).unwrap_err();
        assert!(err.to_string().contains("duplicate pool name"));
    }
}
