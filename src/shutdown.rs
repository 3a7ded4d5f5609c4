use std::future::Future;
use std::time::Duration;

use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{error, info, warn};

/// 优雅关闭：收到信号后通知分派循环，并限时等待它取消集群作业
pub struct GracefulShutdown {
    shutdown_tx: broadcast::Sender<()>,
    grace: Duration,
}

impl GracefulShutdown {
    pub fn new(grace: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx, grace }
    }

    /// 订阅关闭通知，须在 `run` 之前调用
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// 运行 `work` 直到结束。`signal` 先完成时广播关闭，再最多等待宽限期；
    /// 超时返回 `None`，此时仍存活的集群作业需要手动清理。
    pub async fn run<F, S>(self, work: F, signal: S) -> Option<F::Output>
    where
        F: Future,
        S: Future<Output = ()>,
    {
        tokio::pin!(work);
        tokio::select! {
            output = &mut work => Some(output),
            _ = signal => {
                info!("触发关闭，正在取消剩余任务和集群作业");
                let _ = self.shutdown_tx.send(());
                match timeout(self.grace, &mut work).await {
                    Ok(output) => Some(output),
                    Err(_) => {
                        warn!(
                            grace_secs = self.grace.as_secs(),
                            "关闭超时，部分集群作业可能需要手动取消"
                        );
                        None
                    }
                }
            }
        }
    }
}

/// 等待Ctrl+C或SIGTERM
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
        },
        _ = terminate => {
            info!("收到SIGTERM信号");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_work_finishing_first_skips_shutdown() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(1));
        let mut rx = shutdown.subscribe();

        let output = shutdown
            .run(async { 7 }, std::future::pending::<()>())
            .await;
        assert_eq!(output, Some(7));
        // 发送端已释放且没有发送过关闭通知
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_signal_notifies_work_and_waits_for_it() {
        let shutdown = GracefulShutdown::new(Duration::from_secs(1));
        let mut rx = shutdown.subscribe();

        let work = async move {
            rx.recv().await.is_ok()
        };
        let output = shutdown
            .run(work, sleep(Duration::from_millis(10)))
            .await;
        assert_eq!(output, Some(true));
    }

    #[tokio::test]
    async fn test_work_ignoring_signal_times_out() {
        let shutdown = GracefulShutdown::new(Duration::from_millis(20));
        let _rx = shutdown.subscribe();

        let output = shutdown
            .run(
                std::future::pending::<()>(),
                sleep(Duration::from_millis(5)),
            )
            .await;
        assert_eq!(output, None);
    }
}
