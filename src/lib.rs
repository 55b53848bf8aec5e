//! Fleet daemon library
//!
//! Core of the self-hosted CI runner fleet manager: an autoscaled pool of
//! ephemeral container-backed runners attached to a source-control
//! provider, plus a delegation path that routes queued jobs onto idle
//! runners.

pub mod config;
pub mod database;
pub mod dispatch;
pub mod docker;
pub mod error;
pub mod events;
pub mod fleet;
pub mod provider;
pub mod registry;
pub mod scaler;
pub mod system;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export commonly used types
pub use config::Configuration;
pub use error::{Error, Result};
pub use events::EventBus;
pub use fleet::FleetManager;
pub use registry::Registry;
