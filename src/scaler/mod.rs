//! Autoscaling module
//!
//! Periodic control loop per pool: observes utilization via the provider
//! and the registry, commands the lifecycle manager to spawn or retire
//! runners under bounds, cooldown and hysteresis, and records every
//! decision as an append-only scaling event.

mod autoscaler;
mod events;
mod metrics;

pub use autoscaler::Autoscaler;
pub use events::{ScaleReason, ScalingEvent, ScalingKind};
pub use metrics::MetricsSnapshot;
