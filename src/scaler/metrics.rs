//! Pool utilization metrics

use crate::types::{Runner, RunnerStatus};

/// Point-in-time aggregate over a pool's online runners
///
/// Recomputed on every monitoring tick, never cached across ticks.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Online runners (idle + busy)
    pub total: u32,
    pub busy: u32,
    pub idle: u32,
    /// The runners behind the numbers, online only
    pub runners: Vec<Runner>,
}

impl MetricsSnapshot {
    /// Aggregate a registry snapshot, keeping only online runners
    pub fn compute(runners: impl IntoIterator<Item = Runner>) -> Self {
        let online: Vec<Runner> = runners
            .into_iter()
            .filter(|r| r.status.is_online())
            .collect();

        let busy = online
            .iter()
            .filter(|r| r.status == RunnerStatus::Busy)
            .count() as u32;
        let total = online.len() as u32;

        Self {
            total,
            busy,
            idle: total - busy,
            runners: online,
        }
    }

    /// busy / total, 0 when the pool is empty
    pub fn utilization(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.busy as f64 / self.total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(name: &str, status: RunnerStatus) -> Runner {
        let mut r = Runner::new(name.to_string(), None, vec![]);
        r.status = status;
        r
    }

    #[test]
    fn test_empty_pool_has_zero_utilization() {
        let metrics = MetricsSnapshot::compute(vec![]);
        assert_eq!(metrics.total, 0);
        assert_eq!(metrics.utilization(), 0.0);
    }

    #[test]
    fn test_only_online_runners_count() {
        let metrics = MetricsSnapshot::compute(vec![
            runner("a", RunnerStatus::Idle),
            runner("b", RunnerStatus::Busy),
            runner("c", RunnerStatus::Starting),
            runner("d", RunnerStatus::Stopping),
            runner("e", RunnerStatus::Offline),
            runner("f", RunnerStatus::Failed),
        ]);

        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.busy, 1);
        assert_eq!(metrics.idle, 1);
        assert!((metrics.utilization() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_utilization_ratio() {
        let mut runners: Vec<Runner> = (0..9)
            .map(|i| runner(&format!("busy-{}", i), RunnerStatus::Busy))
            .collect();
        runners.push(runner("idle-0", RunnerStatus::Idle));

        let metrics = MetricsSnapshot::compute(runners);
        assert_eq!(metrics.total, 10);
        assert!((metrics.utilization() - 0.9).abs() < f64::EPSILON);
    }
}
