//! 池统计指标
//!
//! 每个分派周期发布一次gauge，任务结果计数在上报时累加。
//! 没有安装exporter时这些调用不产生任何效果。

use batchpool_domain::PoolStats;

pub const WORKERS_GAUGE: &str = "batchpool_workers";
pub const QUEUED_GAUGE: &str = "batchpool_tasks_queued";
pub const IN_FLIGHT_GAUGE: &str = "batchpool_tasks_in_flight";
pub const OUTCOMES_COUNTER: &str = "batchpool_task_outcomes_total";

/// Worker数量按状态标签展开，`dead` 为累计值
fn worker_states(pool: &PoolStats) -> [(&'static str, usize); 6] {
    [
        ("pending", pool.pending),
        ("running", pool.running),
        ("idle", pool.idle),
        ("busy", pool.busy),
        ("terminating", pool.terminating),
        ("dead", pool.dead),
    ]
}

pub fn publish(stats: &[PoolStats]) {
    for pool in stats {
        for (state, count) in worker_states(pool) {
            metrics::gauge!(WORKERS_GAUGE, "pool" => pool.pool.clone(), "state" => state)
                .set(count as f64);
        }
        metrics::gauge!(QUEUED_GAUGE, "pool" => pool.pool.clone()).set(pool.queued_tasks as f64);
        metrics::gauge!(IN_FLIGHT_GAUGE, "pool" => pool.pool.clone())
            .set(pool.in_flight_tasks as f64);
    }
}

/// 无法路由的任务记在 `unrouted` 下
pub fn record_outcome(pool: Option<&str>, outcome: &'static str) {
    let pool = pool.unwrap_or("unrouted").to_string();
    metrics::counter!(OUTCOMES_COUNTER, "pool" => pool, "outcome" => outcome).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_states_cover_every_state() {
        let stats = PoolStats {
            pool: "small".to_string(),
            pending: 1,
            running: 2,
            idle: 3,
            busy: 4,
            terminating: 5,
            dead: 6,
            ..Default::default()
        };
        let states = worker_states(&stats);
        assert_eq!(states.iter().map(|(_, count)| count).sum::<usize>(), 21);
        assert!(states.contains(&("dead", 6)));

        // 没有安装recorder时发布不产生效果
        publish(&[stats]);
        record_outcome(None, "failed");
    }
}
