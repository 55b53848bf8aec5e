//! Container driver trait and spec types

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::types::{ObservedState, ResourceSample};

/// Label marking containers owned by this daemon
pub const LABEL_MANAGED: &str = "io.fleet.managed";

/// Label carrying the bound runner name
pub const LABEL_RUNNER: &str = "io.fleet.runner";

/// Label carrying the repository a container is isolated to
pub const LABEL_REPOSITORY: &str = "io.fleet.repository";

/// Error type for container runtime operations
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container conflict: {0}")]
    Conflict(String),

    #[error("container runtime timed out")]
    Timeout,

    #[error("container runtime error: {0}")]
    Transport(#[from] bollard::errors::Error),

    #[error("invalid container spec: {0}")]
    InvalidSpec(String),
}

impl DriverError {
    /// Whether a caller may retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, DriverError::Timeout | DriverError::Transport(_))
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Specification for a new runner container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container (and runner) name
    pub name: String,

    /// Image to create the container from
    pub image: String,

    /// Environment variables, including the registration token
    pub env: HashMap<String, String>,

    /// Runner capability labels (also attached as container labels)
    pub labels: Vec<String>,

    /// Repository the container is isolated to, if any
    pub repository: Option<String>,

    /// Ephemeral runners auto-remove on exit; others restart on failure
    pub ephemeral: bool,

    /// CPU limit in cores
    pub cpu_limit: Option<f64>,

    /// Memory limit in bytes
    pub memory_limit: Option<u64>,

    /// Docker network to attach to
    pub network: String,

    /// Bind mounts, (source, target, read_only)
    pub mounts: Vec<MountSpec>,
}

/// Bind mount for a runner container
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Options for exec-in-container
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Per-stream capture limit in bytes
    pub buffer_limit: usize,

    /// Extra environment for the exec process
    pub env: HashMap<String, String>,

    /// Working directory inside the container
    pub working_dir: Option<String>,

    /// Overall deadline for the exec
    pub timeout: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            buffer_limit: 64 * 1024,
            env: HashMap::new(),
            working_dir: None,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Captured output of an exec
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    /// Whether either stream hit the capture limit
    pub truncated: bool,
}

/// A managed container discovered in the runtime
#[derive(Debug, Clone)]
pub struct OwnedContainer {
    pub id: String,
    pub runner_name: String,
    pub repository: Option<String>,
    pub image: String,
    pub observed: ObservedState,
}

/// Capability interface to the container runtime
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Create a container; returns the container id
    async fn create(&self, spec: &ContainerSpec) -> DriverResult<String>;

    /// Start a created container
    async fn start(&self, id: &str) -> DriverResult<()>;

    /// Stop a container, killing it after the graceful window
    async fn stop(&self, id: &str, graceful: Duration) -> DriverResult<()>;

    /// Remove a container; absent containers count as success
    async fn remove(&self, id: &str, force: bool) -> DriverResult<()>;

    /// Observe the container's current runtime state
    async fn inspect(&self, id: &str) -> DriverResult<ObservedState>;

    /// Take a one-shot resource sample
    async fn stats(&self, id: &str) -> DriverResult<ResourceSample>;

    /// Run a command inside the container, capturing bounded output
    async fn exec(&self, id: &str, argv: &[String], opts: &ExecOptions)
        -> DriverResult<ExecOutput>;

    /// List all containers carrying the managed label, in any state
    async fn list_owned(&self) -> DriverResult<Vec<OwnedContainer>>;
}
