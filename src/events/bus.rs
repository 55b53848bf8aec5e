//! Event bus for pub/sub messaging
//!
//! Provides a broadcast mechanism for fleet events like runner state
//! changes, scaling decisions, and job transitions. Subscribers that fall
//! behind lose messages (lagged) rather than blocking publishers.

use tokio::sync::broadcast;
use tracing::debug;

use crate::scaler::ScalingEvent;
use crate::types::{JobStatus, RunnerStatus};

/// A scale-up request raised by the dispatcher when no runner matched a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemandHint {
    pub repository: String,
    pub labels: Vec<String>,
}

/// Events published through the bus
#[derive(Debug, Clone)]
pub enum Event {
    /// A runner moved to a new status
    RunnerState {
        name: String,
        status: RunnerStatus,
    },

    /// A runner's container exited unexpectedly
    RunnerCrashed {
        name: String,
        exit_code: i64,
    },

    /// The autoscaler acted (or declined to act) on a pool
    Scaling(ScalingEvent),

    /// A delegated job changed status
    JobTransition {
        id: String,
        status: JobStatus,
    },

    /// The dispatcher could not place a job and wants capacity
    Demand(DemandHint),
}

/// Event bus for broadcasting events to multiple subscribers
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event; returns the number of receivers that saw it
    pub fn publish(&self, event: Event) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Publish a runner status change
    pub fn publish_runner_state(&self, name: &str, status: RunnerStatus) -> usize {
        debug!("runner {} -> {}", name, status);
        self.publish(Event::RunnerState {
            name: name.to_string(),
            status,
        })
    }

    /// Publish a scaling decision
    pub fn publish_scaling(&self, event: ScalingEvent) -> usize {
        self.publish(Event::Scaling(event))
    }

    /// Publish a job transition
    pub fn publish_job(&self, id: &str, status: JobStatus) -> usize {
        self.publish(Event::JobTransition {
            id: id.to_string(),
            status,
        })
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
