//! Container driver module
//!
//! Thin adapter over the Docker daemon exposing the operations the
//! lifecycle manager needs: create, start, stop, remove, inspect, stats and
//! exec. Everything else stays behind the [`ContainerDriver`] trait so
//! tests can substitute an in-memory fake.

mod daemon;
mod driver;
mod exec;
mod stats;

pub use daemon::DockerDriver;
pub use driver::{
    ContainerDriver, ContainerSpec, DriverError, DriverResult, ExecOptions, ExecOutput,
    MountSpec, OwnedContainer, LABEL_MANAGED, LABEL_REPOSITORY, LABEL_RUNNER,
};
