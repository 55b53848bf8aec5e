//! Scaling decision audit records

use chrono::{DateTime, Utc};
use serde::Serialize;

/// What the autoscaler did on a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingKind {
    Up,
    Down,
    Skipped,
}

impl ScalingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScalingKind::Up => "up",
            ScalingKind::Down => "down",
            ScalingKind::Skipped => "skipped",
        }
    }
}

/// Why the autoscaler acted, or declined to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleReason {
    /// Pool below its configured minimum
    MinFloor,
    /// Utilization crossed the scale-up threshold
    Utilization,
    /// Dispatcher raised demand hints for the pool
    Demand,
    /// Utilization stayed below the scale-down threshold
    LowUtilization,
    /// Cooldown window since the last action has not elapsed
    Cooldown,
    /// Another tick still holds the pool lock
    ScalingInProgress,
    /// Pool already at its maximum
    MaxCap,
    /// Nothing to do
    NoAction,
}

impl ScaleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleReason::MinFloor => "min_floor",
            ScaleReason::Utilization => "utilization",
            ScaleReason::Demand => "demand",
            ScaleReason::LowUtilization => "low_utilization",
            ScaleReason::Cooldown => "cooldown",
            ScaleReason::ScalingInProgress => "scaling_in_progress",
            ScaleReason::MaxCap => "max_cap",
            ScaleReason::NoAction => "no_action",
        }
    }
}

/// One entry in the append-only scaling audit stream
#[derive(Debug, Clone, Serialize)]
pub struct ScalingEvent {
    pub repo: String,
    pub kind: ScalingKind,
    pub reason: ScaleReason,
    /// Online runner count before the action
    pub pre_count: u32,
    /// Online runner count after the action settled
    pub post_count: u32,
    /// Extra context, e.g. "capped_at_max"
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

impl ScalingEvent {
    pub fn new(repo: &str, kind: ScalingKind, reason: ScaleReason, pre: u32, post: u32) -> Self {
        Self {
            repo: repo.to_string(),
            kind,
            reason,
            pre_count: pre,
            post_count: post,
            note: None,
            at: Utc::now(),
        }
    }

    pub fn skipped(repo: &str, reason: ScaleReason, count: u32) -> Self {
        Self::new(repo, ScalingKind::Skipped, reason, count, count)
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers() {
        assert_eq!(ScalingKind::Up.as_str(), "up");
        assert_eq!(ScalingKind::Skipped.as_str(), "skipped");
        assert_eq!(ScaleReason::MinFloor.as_str(), "min_floor");
        assert_eq!(ScaleReason::MaxCap.as_str(), "max_cap");
    }

    #[test]
    fn test_skipped_keeps_count() {
        let event = ScalingEvent::skipped("acme/widgets", ScaleReason::Cooldown, 7);
        assert_eq!(event.pre_count, 7);
        assert_eq!(event.post_count, 7);
        assert_eq!(event.kind, ScalingKind::Skipped);
    }
}
