use std::collections::BTreeMap;
use std::sync::Arc;

use batchpool_config::validate_pools;
use batchpool_domain::{
    BatchScheduler, PoolStats, SchedulerError, SchedulerResult, Task, WorkerPoolConfig,
};
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::events::DispatchEvent;
use crate::pool::{QueuedTask, WorkerPool};
use crate::retry::Backoff;

/// 按资源标签把任务路由到池
///
/// 标签与池名精确匹配，否则回退到默认池。池集合在整个运行期间不变。
pub struct ControllerGroup {
    pools: BTreeMap<String, Arc<WorkerPool>>,
    default_pool: Option<String>,
}

impl ControllerGroup {
    /// 构建所有池。先校验池配置的取值范围、名称唯一和默认池，
    /// 再由调度器后端校验每个池的脚本配置。
    pub fn new(
        configs: Vec<WorkerPoolConfig>,
        default_pool: Option<String>,
        scheduler: Arc<dyn BatchScheduler>,
        backoff: Backoff,
        unknown_threshold: u32,
        events: mpsc::UnboundedSender<DispatchEvent>,
    ) -> SchedulerResult<Self> {
        validate_pools(&configs, default_pool.as_deref())?;

        let mut pools = BTreeMap::new();
        for config in configs {
            scheduler.validate_pool(&config)?;
            let name = config.name.clone();
            let pool = WorkerPool::new(
                config,
                Arc::clone(&scheduler),
                backoff.clone(),
                unknown_threshold,
                events.clone(),
            );
            pools.insert(name, pool);
        }

        info!(
            "已创建 {} 个Worker池 (后端 {})，默认池: {}",
            pools.len(),
            scheduler.name(),
            default_pool.as_deref().unwrap_or("无")
        );
        Ok(Self {
            pools,
            default_pool,
        })
    }

    pub fn route(&self, task: &Task) -> SchedulerResult<Arc<WorkerPool>> {
        let pool = self
            .pools
            .get(&task.resource_profile_tag)
            .or_else(|| {
                self.default_pool
                    .as_ref()
                    .and_then(|name| self.pools.get(name))
            })
            .ok_or_else(|| SchedulerError::unroutable(&task.id, &task.resource_profile_tag))?;

        debug!("任务 {} (标签 {}) 路由到池 {}", task.id, task.resource_profile_tag, pool.name());
        Ok(Arc::clone(pool))
    }

    pub fn pool(&self, name: &str) -> Option<Arc<WorkerPool>> {
        self.pools.get(name).cloned()
    }

    pub fn pools(&self) -> impl Iterator<Item = &Arc<WorkerPool>> {
        self.pools.values()
    }

    pub fn default_pool(&self) -> Option<&str> {
        self.default_pool.as_deref()
    }

    pub async fn start_all(&self) {
        for pool in self.pools.values() {
            pool.start().await;
        }
    }

    /// 按池名排序的统计快照
    pub async fn snapshot(&self) -> Vec<PoolStats> {
        join_all(self.pools.values().map(|pool| pool.stats())).await
    }

    /// 关闭所有池，返回每个池中被清空的排队任务
    pub async fn shutdown_all(&self) -> Vec<(String, Vec<QueuedTask>)> {
        join_all(self.pools.values().map(|pool| async move {
            (pool.name().to_string(), pool.shutdown().await)
        }))
        .await
    }
}
