//! Event system module
//!
//! Pub/sub event bus broadcasting runner state changes, scaling decisions,
//! crash notifications and job transitions to any interested collaborator.

mod bus;

pub use bus::{DemandHint, Event, EventBus};
