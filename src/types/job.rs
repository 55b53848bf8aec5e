//! Delegated job model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a delegated job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Received but not yet accepted into the queue
    Pending,
    Queued,
    /// Picked for a runner; waiting for the runner to report it
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Assigned => "assigned",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "assigned" => Ok(JobStatus::Assigned),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// A job delegated to the fleet via the webhook intake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegatedJob {
    /// External job id from the provider
    pub id: String,

    pub repository: String,

    pub workflow: String,

    /// Labels the executing runner must carry
    pub labels: Vec<String>,

    pub status: JobStatus,

    /// Runner the job was assigned to, once picked
    pub assigned_runner: Option<String>,

    /// Relative scheduling priority; higher is drained first
    pub priority: u8,

    pub queued_at: DateTime<Utc>,

    pub assigned_at: Option<DateTime<Utc>>,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl DelegatedJob {
    pub fn new(id: String, repository: String, workflow: String, labels: Vec<String>) -> Self {
        Self {
            id,
            repository,
            workflow,
            labels,
            status: JobStatus::Queued,
            assigned_runner: None,
            priority: 0,
            queued_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}
