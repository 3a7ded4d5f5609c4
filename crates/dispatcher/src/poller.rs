use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::pool::WorkerPool;

/// 按固定间隔查询一个池的Worker作业状态，直到收到关闭信号
///
/// 每个池有独立的轮询任务。状态变化由池以事件形式发回分派循环。
pub fn spawn_poller(
    pool: Arc<WorkerPool>,
    poll_interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::spawn(async move {
        info!("池 {} 作业状态轮询已启动，间隔 {:?}", pool.name(), poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    pool.poll_workers().await;
                    debug!("池 {} 完成一轮作业状态查询", pool.name());
                }
                _ = shutdown_rx.recv() => {
                    info!("池 {} 作业状态轮询停止", pool.name());
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DispatchEvent;
    use crate::retry::Backoff;
    use batchpool_testing_utils::{MockBatchScheduler, PoolConfigBuilder, TaskBuilder};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_poller_reports_ready_workers_and_stops() {
        let scheduler = MockBatchScheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(
            PoolConfigBuilder::new("small").build(),
            Arc::new(scheduler.clone()),
            Backoff::default(),
            3,
            tx,
        );
        pool.enqueue(TaskBuilder::new("t1").with_tag("small").build())
            .await
            .unwrap();
        assert!(pool.acquire_worker().await.is_none());

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = spawn_poller(Arc::clone(&pool), Duration::from_millis(5), shutdown_rx);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert!(matches!(event, Some(DispatchEvent::WorkerReady { .. })));

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
