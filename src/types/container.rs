//! Container records owned by the lifecycle manager

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Smoothing factor for resource samples
const SAMPLE_ALPHA: f64 = 0.3;

/// Consecutive stats failures before a container is marked Errored
const STAT_FAILURE_LIMIT: u8 = 3;

/// State the lifecycle manager wants the container to be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Created,
    Running,
    Stopped,
    Removed,
    Errored,
}

/// State last observed from the container runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    /// The runtime no longer knows the container
    Missing,
}

impl From<&str> for ObservedState {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "exited" => Self::Exited,
            "removing" | "dead" => Self::Dead,
            _ => Self::Missing,
        }
    }
}

impl ObservedState {
    /// Whether the container has reached a state that permits removal
    pub fn is_stopped(&self) -> bool {
        matches!(
            self,
            Self::Exited | Self::Dead | Self::Missing | Self::Created
        )
    }
}

/// Point-in-time resource usage for a container
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceSample {
    /// CPU usage as absolute percentage (100 = one core)
    pub cpu_percent: f64,
    /// Memory usage in bytes
    pub memory_bytes: u64,
    /// Total bytes received across interfaces
    pub net_rx_bytes: u64,
    /// Total bytes transmitted across interfaces
    pub net_tx_bytes: u64,
}

impl ResourceSample {
    /// Exponentially smooth a new sample against the previous one
    pub fn smooth(prev: Option<ResourceSample>, next: ResourceSample) -> ResourceSample {
        match prev {
            None => next,
            Some(prev) => ResourceSample {
                cpu_percent: ewma(prev.cpu_percent, next.cpu_percent),
                memory_bytes: ewma(prev.memory_bytes as f64, next.memory_bytes as f64) as u64,
                // Counters are monotonic; smoothing them would understate totals
                net_rx_bytes: next.net_rx_bytes,
                net_tx_bytes: next.net_tx_bytes,
            },
        }
    }
}

fn ewma(prev: f64, next: f64) -> f64 {
    SAMPLE_ALPHA * next + (1.0 - SAMPLE_ALPHA) * prev
}

/// A container tracked by the lifecycle manager
///
/// Exclusively owned by the lifecycle manager; runners reference it by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Container id from the runtime
    pub id: String,

    /// Name of the runner bound to this container
    pub runner_name: String,

    /// Repository the container is isolated to, if any
    pub repository: Option<String>,

    pub image: String,

    pub labels: Vec<String>,

    pub desired: DesiredState,

    pub observed: ObservedState,

    /// Latest smoothed resource sample
    pub sample: Option<ResourceSample>,

    /// Consecutive stats failures
    pub stat_failures: u8,

    pub created_at: DateTime<Utc>,

    pub state_changed_at: DateTime<Utc>,
}

impl ContainerRecord {
    pub fn new(
        id: String,
        runner_name: String,
        repository: Option<String>,
        image: String,
        labels: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            runner_name,
            repository,
            image,
            labels,
            desired: DesiredState::Created,
            observed: ObservedState::Created,
            sample: None,
            stat_failures: 0,
            created_at: now,
            state_changed_at: now,
        }
    }

    /// Record a desired-state transition
    pub fn set_desired(&mut self, desired: DesiredState) {
        if self.desired != desired {
            self.desired = desired;
            self.state_changed_at = Utc::now();
        }
    }

    /// Record a newly observed runtime state
    pub fn set_observed(&mut self, observed: ObservedState) {
        if self.observed != observed {
            self.observed = observed;
            self.state_changed_at = Utc::now();
        }
    }

    /// Fold a raw sample into the smoothed series
    pub fn record_sample(&mut self, raw: ResourceSample) {
        self.sample = Some(ResourceSample::smooth(self.sample, raw));
        self.stat_failures = 0;
    }

    /// Count a failed stats poll; returns true once the failure limit is hit
    pub fn record_stat_failure(&mut self) -> bool {
        self.stat_failures = self.stat_failures.saturating_add(1);
        if self.stat_failures >= STAT_FAILURE_LIMIT {
            self.set_desired(DesiredState::Errored);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observed_state_from_str() {
        assert_eq!(ObservedState::from("running"), ObservedState::Running);
        assert_eq!(ObservedState::from("Exited"), ObservedState::Exited);
        assert_eq!(ObservedState::from("dead"), ObservedState::Dead);
        assert_eq!(ObservedState::from("gone?"), ObservedState::Missing);
    }

    #[test]
    fn test_smoothing_first_sample_passthrough() {
        let raw = ResourceSample {
            cpu_percent: 50.0,
            memory_bytes: 1000,
            net_rx_bytes: 10,
            net_tx_bytes: 20,
        };
        let smoothed = ResourceSample::smooth(None, raw);
        assert_eq!(smoothed.cpu_percent, 50.0);
        assert_eq!(smoothed.memory_bytes, 1000);
    }

    #[test]
    fn test_smoothing_weights_new_sample() {
        let prev = ResourceSample {
            cpu_percent: 100.0,
            memory_bytes: 1000,
            net_rx_bytes: 10,
            net_tx_bytes: 10,
        };
        let next = ResourceSample {
            cpu_percent: 0.0,
            memory_bytes: 2000,
            net_rx_bytes: 50,
            net_tx_bytes: 60,
        };
        let smoothed = ResourceSample::smooth(Some(prev), next);

        // alpha = 0.3: 0.3 * 0 + 0.7 * 100 = 70
        assert!((smoothed.cpu_percent - 70.0).abs() < f64::EPSILON);
        assert_eq!(smoothed.memory_bytes, 1300);
        // Network counters pass through unsmoothed
        assert_eq!(smoothed.net_rx_bytes, 50);
        assert_eq!(smoothed.net_tx_bytes, 60);
    }

    #[test]
    fn test_stat_failure_limit() {
        let mut record = ContainerRecord::new(
            "abc".into(),
            "ci-1-aa".into(),
            None,
            "runner:latest".into(),
            vec![],
        );

        assert!(!record.record_stat_failure());
        assert!(!record.record_stat_failure());
        assert!(record.record_stat_failure());
        assert_eq!(record.desired, DesiredState::Errored);

        // A successful sample resets the counter
        record.record_sample(ResourceSample::default());
        assert_eq!(record.stat_failures, 0);
    }
}
