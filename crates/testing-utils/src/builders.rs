//! Test data builders for creating test entities
//!
//! This module provides builder patterns for creating test data with
//! sensible defaults and easy customization.

use batchpool_domain::{ResourceSpec, Task, WorkerPoolConfig};

/// Builder for creating test Task entities
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            task: Task::new(id, "default", serde_json::json!(format!("echo {id}"))),
        }
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.task.resource_profile_tag = tag.to_string();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.task.payload = payload;
        self
    }

    pub fn with_dependency(mut self, dependency: &str) -> Self {
        self.task.dependencies.insert(dependency.to_string());
        self
    }

    pub fn build(self) -> Task {
        self.task
    }

    /// `count` tasks named `{prefix}-{n}` with the same tag
    pub fn batch(prefix: &str, tag: &str, count: usize) -> Vec<Task> {
        (0..count)
            .map(|n| Self::new(&format!("{prefix}-{n}")).with_tag(tag).build())
            .collect()
    }
}

/// Builder for creating test WorkerPoolConfig entities
pub struct PoolConfigBuilder {
    config: WorkerPoolConfig,
}

impl PoolConfigBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            config: WorkerPoolConfig::new(name, ResourceSpec::new(1, 1.0), 2),
        }
    }

    pub fn cpus(mut self, cpus: u32) -> Self {
        self.config.resources.cpus = cpus;
        self
    }

    pub fn memory_gb(mut self, memory_gb: f64) -> Self {
        self.config.resources.memory_gb = memory_gb;
        self
    }

    pub fn gpus(mut self, gpus: u32) -> Self {
        self.config.resources.gpus = gpus;
        self
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.config.max_workers = max_workers;
        self
    }

    pub fn min_workers(mut self, min_workers: usize) -> Self {
        self.config.min_workers = min_workers;
        self
    }

    pub fn idle_timeout_seconds(mut self, seconds: u64) -> Self {
        self.config.idle_timeout_seconds = Some(seconds);
        self
    }

    pub fn script_line(mut self, line: &str) -> Self {
        self.config.script_lines.push(line.to_string());
        self
    }

    pub fn extra_flag(mut self, flag: &str) -> Self {
        self.config.resources.extra_flags.push(flag.to_string());
        self
    }

    pub fn build(self) -> WorkerPoolConfig {
        self.config
    }
}
