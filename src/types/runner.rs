//! Runner identity and status

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a managed runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    /// Container is up, waiting for the provider to list the runner online
    Starting,
    /// Online at the provider and not executing a job
    Idle,
    /// Online at the provider and executing a job
    Busy,
    /// Graceful stop in progress
    Stopping,
    /// Container stopped; provider-side record may still need deletion
    Offline,
    /// Crashed or otherwise unhealthy; eligible for replacement
    Failed,
}

impl RunnerStatus {
    /// Whether the runner counts toward pool capacity
    pub fn is_online(&self) -> bool {
        matches!(self, RunnerStatus::Idle | RunnerStatus::Busy)
    }
}

impl std::fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunnerStatus::Starting => "starting",
            RunnerStatus::Idle => "idle",
            RunnerStatus::Busy => "busy",
            RunnerStatus::Stopping => "stopping",
            RunnerStatus::Offline => "offline",
            RunnerStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for RunnerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(RunnerStatus::Starting),
            "idle" => Ok(RunnerStatus::Idle),
            "busy" => Ok(RunnerStatus::Busy),
            "stopping" => Ok(RunnerStatus::Stopping),
            "offline" => Ok(RunnerStatus::Offline),
            "failed" => Ok(RunnerStatus::Failed),
            other => Err(format!("unknown runner status: {}", other)),
        }
    }
}

/// A runner owned by this manager
///
/// The authoritative copy lives in the registry; the durable row mirrors it
/// best-effort. The container record is owned by the lifecycle manager and
/// referenced here only by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    /// Unique name, `<prefix>-<epoch-ms>-<rand>`
    pub name: String,

    /// Provider-side id, assigned once the provider lists the runner
    pub provider_id: Option<i64>,

    /// Backing container id
    pub container_id: Option<String>,

    /// Capability labels, in registration order
    pub labels: Vec<String>,

    /// Repository the runner is bound to, if any
    pub repository: Option<String>,

    /// Current status
    pub status: RunnerStatus,

    /// Last time the provider reported this runner online
    pub last_heartbeat: DateTime<Utc>,

    /// Set when the runner last transitioned to Idle
    pub idle_since: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Runner {
    /// Create a new runner entry in the Starting state
    pub fn new(name: String, repository: Option<String>, labels: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            name,
            provider_id: None,
            container_id: None,
            labels,
            repository,
            status: RunnerStatus::Starting,
            last_heartbeat: now,
            idle_since: None,
            created_at: now,
        }
    }

    /// Seconds the runner has been idle, or 0 if not idle
    pub fn idle_seconds(&self, now: DateTime<Utc>) -> i64 {
        match (self.status, self.idle_since) {
            (RunnerStatus::Idle, Some(since)) => (now - since).num_seconds().max(0),
            _ => 0,
        }
    }
}

/// Generate a unique runner name: `<prefix>-<epoch-ms>-<rand>`
///
/// The millisecond timestamp plus a random 32-bit suffix keeps two spawns in
/// the same instant from colliding; the registry still enforces uniqueness.
pub fn generate_runner_name(prefix: &str) -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix: u32 = rand::random();
    format!("{}-{}-{:08x}", prefix, millis, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_format() {
        let name = generate_runner_name("ci");
        let parts: Vec<&str> = name.splitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "ci");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn test_names_are_distinct() {
        let a = generate_runner_name("ci");
        let b = generate_runner_name("ci");
        assert_ne!(a, b);
    }

    #[test]
    fn test_online_statuses() {
        assert!(RunnerStatus::Idle.is_online());
        assert!(RunnerStatus::Busy.is_online());
        assert!(!RunnerStatus::Starting.is_online());
        assert!(!RunnerStatus::Stopping.is_online());
        assert!(!RunnerStatus::Offline.is_online());
        assert!(!RunnerStatus::Failed.is_online());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            RunnerStatus::Starting,
            RunnerStatus::Idle,
            RunnerStatus::Busy,
            RunnerStatus::Stopping,
            RunnerStatus::Offline,
            RunnerStatus::Failed,
        ] {
            let parsed: RunnerStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_idle_seconds() {
        let mut runner = Runner::new("ci-1-aa".into(), None, vec![]);
        let now = Utc::now();
        assert_eq!(runner.idle_seconds(now), 0);

        runner.status = RunnerStatus::Idle;
        runner.idle_since = Some(now - chrono::Duration::seconds(90));
        assert!(runner.idle_seconds(now) >= 90);
    }
}
