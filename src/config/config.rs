//! Configuration structures and loading

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Configuration {
    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// Source-control provider configuration
    #[serde(default)]
    pub provider: ProviderConfiguration,

    /// Container runtime configuration
    #[serde(default)]
    pub docker: DockerConfiguration,

    /// Autoscaling configuration
    #[serde(default)]
    pub scaling: ScalingConfiguration,

    /// Job delegation configuration
    #[serde(default)]
    pub dispatch: DispatchConfiguration,

    /// Durable state configuration
    #[serde(default)]
    pub database: DatabaseConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file, apply environment overrides,
    /// and validate. A missing file yields pure defaults plus environment.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                Error::Invalid(format!("failed to read config file {}: {}", path, e))
            })?;
            toml::from_str(&content)
                .map_err(|e| Error::Invalid(format!("failed to parse configuration: {}", e)))?
        } else {
            Configuration::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply the recognized environment variable overrides
    ///
    /// Pool-scoped variables target the default ("*") pool.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PROVIDER_URL") {
            self.provider.url = v;
        }
        if let Ok(v) = std::env::var("PROVIDER_TOKEN") {
            self.provider.token = v;
        }
        if let Ok(v) = std::env::var("PROVIDER_ORG") {
            self.provider.org = v;
        }
        if let Ok(v) = std::env::var("PROVIDER_REPO") {
            self.provider.repo = v;
        }
        if let Ok(v) = std::env::var("RUNNER_IMAGE") {
            self.docker.runner.image = v;
        }
        if let Ok(Ok(n)) = std::env::var("BLOCK_AFTER_VIOLATIONS").map(|v| v.parse()) {
            self.provider.rate_limit.block_after_violations = n;
        }
        if let Ok(Ok(n)) = std::env::var("MONITOR_INTERVAL_SECONDS").map(|v| v.parse()) {
            self.scaling.monitor_interval_seconds = n;
        }
        if let Ok(Ok(n)) = std::env::var("CLEANUP_INTERVAL_SECONDS").map(|v| v.parse()) {
            self.scaling.cleanup_interval_seconds = n;
        }
        if let Ok(Ok(n)) = std::env::var("SHUTDOWN_GRACE_SECONDS").map(|v| v.parse()) {
            self.scaling.shutdown_grace_seconds = n;
        }
        if let Ok(Ok(n)) = std::env::var("ASSIGNMENT_TIMEOUT_SECONDS").map(|v| v.parse()) {
            self.dispatch.assignment_timeout_seconds = n;
        }

        let pool = self.scaling.default_pool_mut();
        if let Ok(Ok(n)) = std::env::var("MIN_RUNNERS").map(|v| v.parse()) {
            pool.min_runners = n;
        }
        if let Ok(Ok(n)) = std::env::var("MAX_RUNNERS").map(|v| v.parse()) {
            pool.max_runners = n;
        }
        if let Ok(Ok(n)) = std::env::var("SCALE_THRESHOLD").map(|v| v.parse()) {
            pool.scale_threshold = n;
        }
        if let Ok(Ok(n)) = std::env::var("SCALE_INCREMENT").map(|v| v.parse()) {
            pool.scale_increment = n;
        }
        if let Ok(Ok(n)) = std::env::var("COOLDOWN_SECONDS").map(|v| v.parse()) {
            pool.cooldown_seconds = n;
        }
        if let Ok(Ok(n)) = std::env::var("IDLE_TIMEOUT_SECONDS").map(|v| v.parse()) {
            pool.idle_timeout_seconds = n;
        }
    }

    /// Validate required fields and pool invariants
    pub fn validate(&self) -> Result<()> {
        if self.provider.token.is_empty() {
            return Err(Error::Invalid("provider token is required".into()));
        }
        if self.provider.org.is_empty() {
            return Err(Error::Invalid("provider org is required".into()));
        }
        if self.provider.repo.is_empty() {
            return Err(Error::Invalid("provider repo is required".into()));
        }
        if self.docker.runner.image.is_empty() {
            return Err(Error::Invalid("runner image is required".into()));
        }
        for pool in &self.scaling.pools {
            pool.validate()?;
        }
        Ok(())
    }
}

/// Provider API configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfiguration {
    /// Provider API base URL
    #[serde(default = "default_provider_url")]
    pub url: String,

    /// Bearer credential scoped to the org/repo
    #[serde(default)]
    pub token: String,

    #[serde(default)]
    pub org: String,

    #[serde(default)]
    pub repo: String,

    /// Per-call timeout in seconds
    #[serde(default = "default_provider_timeout")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub rate_limit: RateLimitConfiguration,
}

impl Default for ProviderConfiguration {
    fn default() -> Self {
        Self {
            url: default_provider_url(),
            token: String::new(),
            org: String::new(),
            repo: String::new(),
            timeout_seconds: default_provider_timeout(),
            rate_limit: RateLimitConfiguration::default(),
        }
    }
}

fn default_provider_url() -> String {
    "https://api.github.com".into()
}

fn default_provider_timeout() -> u64 {
    15
}

/// Client-side token-bucket rate limiter configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfiguration {
    /// Bucket capacity (burst size)
    #[serde(default = "default_rate_burst")]
    pub burst: u32,

    /// Sustained requests per second
    #[serde(default = "default_rate_per_second")]
    pub per_second: f64,

    /// Limiter waits tolerated before the client auto-blocks
    #[serde(default = "default_block_after_violations")]
    pub block_after_violations: u32,

    /// How long an auto-block lasts, in seconds
    #[serde(default = "default_block_seconds")]
    pub block_seconds: u64,
}

impl Default for RateLimitConfiguration {
    fn default() -> Self {
        Self {
            burst: default_rate_burst(),
            per_second: default_rate_per_second(),
            block_after_violations: default_block_after_violations(),
            block_seconds: default_block_seconds(),
        }
    }
}

fn default_rate_burst() -> u32 {
    10
}

fn default_rate_per_second() -> f64 {
    5.0
}

fn default_block_after_violations() -> u32 {
    50
}

fn default_block_seconds() -> u64 {
    60
}

/// Container runtime configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DockerConfiguration {
    /// Docker socket path
    #[serde(default = "default_docker_socket")]
    pub socket: String,

    /// Network runner containers attach to
    #[serde(default = "default_network")]
    pub network: String,

    /// Timeout for container creation, in seconds
    #[serde(default = "default_create_timeout")]
    pub create_timeout_seconds: u64,

    /// Default graceful stop window, in seconds
    #[serde(default = "default_stop_grace")]
    pub stop_grace_seconds: u64,

    /// Resource sampling interval, in seconds
    #[serde(default = "default_stats_interval")]
    pub stats_interval_seconds: u64,

    #[serde(default)]
    pub runner: RunnerContainerConfiguration,
}

impl Default for DockerConfiguration {
    fn default() -> Self {
        Self {
            socket: default_docker_socket(),
            network: default_network(),
            create_timeout_seconds: default_create_timeout(),
            stop_grace_seconds: default_stop_grace(),
            stats_interval_seconds: default_stats_interval(),
            runner: RunnerContainerConfiguration::default(),
        }
    }
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".into()
}

fn default_network() -> String {
    "bridge".into()
}

fn default_create_timeout() -> u64 {
    60
}

fn default_stop_grace() -> u64 {
    30
}

fn default_stats_interval() -> u64 {
    10
}

/// Runner container image and shape
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerContainerConfiguration {
    /// Image every runner container is created from
    #[serde(default)]
    pub image: String,

    /// Prefix for generated runner names
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Labels registered with the provider for every runner
    #[serde(default)]
    pub labels: Vec<String>,

    /// Whether runners exit after one job (containers auto-remove)
    #[serde(default = "default_ephemeral")]
    pub ephemeral: bool,

    /// CPU limit in cores; unset means unlimited
    #[serde(default)]
    pub cpu_limit: Option<f64>,

    /// Memory limit in megabytes; unset means unlimited
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,

    /// Extra environment passed to every runner container
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Bind mounts for runner containers
    #[serde(default)]
    pub mounts: Vec<MountEntry>,
}

impl Default for RunnerContainerConfiguration {
    fn default() -> Self {
        Self {
            image: String::new(),
            name_prefix: default_name_prefix(),
            labels: Vec::new(),
            ephemeral: default_ephemeral(),
            cpu_limit: None,
            memory_limit_mb: None,
            env: HashMap::new(),
            mounts: Vec::new(),
        }
    }
}

fn default_name_prefix() -> String {
    "runner".into()
}

fn default_ephemeral() -> bool {
    true
}

/// Bind mount for runner containers
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Autoscaling configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScalingConfiguration {
    /// Autoscaler tick interval, in seconds
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_seconds: u64,

    /// Cleanup sweep interval, in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,

    /// Bounded grace period for shutdown, in seconds
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_seconds: u64,

    /// Per-repository pools; "*" is the default scope
    #[serde(default = "default_pools")]
    pub pools: Vec<PoolConfig>,
}

impl ScalingConfiguration {
    /// Find the pool config for a repository: exact match wins over glob,
    /// glob over the default pool.
    pub fn pool_for(&self, repo: &str) -> PoolConfig {
        if let Some(pool) = self.pools.iter().find(|p| p.repo == repo) {
            return pool.clone();
        }
        if let Some(pool) = self.pools.iter().find(|p| {
            p.repo != "*"
                && glob::Pattern::new(&p.repo)
                    .map(|pat| pat.matches(repo))
                    .unwrap_or(false)
        }) {
            return pool.clone();
        }
        self.pools
            .iter()
            .find(|p| p.repo == "*")
            .cloned()
            .unwrap_or_default()
    }

    /// The default ("*") pool, created if the file omitted it
    pub fn default_pool_mut(&mut self) -> &mut PoolConfig {
        if !self.pools.iter().any(|p| p.repo == "*") {
            self.pools.push(PoolConfig::default());
        }
        let idx = self.pools.iter().position(|p| p.repo == "*").unwrap_or(0);
        &mut self.pools[idx]
    }
}

impl Default for ScalingConfiguration {
    fn default() -> Self {
        Self {
            monitor_interval_seconds: default_monitor_interval(),
            cleanup_interval_seconds: default_cleanup_interval(),
            shutdown_grace_seconds: default_shutdown_grace(),
            pools: default_pools(),
        }
    }
}

fn default_monitor_interval() -> u64 {
    30
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_shutdown_grace() -> u64 {
    300
}

fn default_pools() -> Vec<PoolConfig> {
    vec![PoolConfig::default()]
}

/// Per-pool scaling parameters
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    /// Repository scope glob; "*" matches everything
    #[serde(default = "default_pool_repo")]
    pub repo: String,

    #[serde(default = "default_min_runners")]
    pub min_runners: u32,

    #[serde(default = "default_max_runners")]
    pub max_runners: u32,

    /// Utilization at or above which the pool scales up, in (0, 1]
    #[serde(default = "default_scale_threshold")]
    pub scale_threshold: f64,

    /// Runners added per scale-up
    #[serde(default = "default_scale_increment")]
    pub scale_increment: u32,

    /// Utilization at or below which the pool may scale down;
    /// defaults to half the scale-up threshold
    #[serde(default)]
    pub scale_down_threshold: Option<f64>,

    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,

    /// Minimum idle duration before a runner is eligible for scale-down
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_runners > self.max_runners {
            return Err(Error::Invalid(format!(
                "pool {}: min_runners {} exceeds max_runners {}",
                self.repo, self.min_runners, self.max_runners
            )));
        }
        if self.scale_increment < 1 {
            return Err(Error::Invalid(format!(
                "pool {}: scale_increment must be at least 1",
                self.repo
            )));
        }
        if !(self.scale_threshold > 0.0 && self.scale_threshold <= 1.0) {
            return Err(Error::Invalid(format!(
                "pool {}: scale_threshold must be in (0, 1]",
                self.repo
            )));
        }
        if let Some(down) = self.scale_down_threshold {
            if !(0.0..=1.0).contains(&down) {
                return Err(Error::Invalid(format!(
                    "pool {}: scale_down_threshold must be in [0, 1]",
                    self.repo
                )));
            }
        }
        Ok(())
    }

    /// Effective scale-down threshold
    pub fn scale_down_threshold(&self) -> f64 {
        self.scale_down_threshold
            .unwrap_or(self.scale_threshold / 2.0)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            repo: default_pool_repo(),
            min_runners: default_min_runners(),
            max_runners: default_max_runners(),
            scale_threshold: default_scale_threshold(),
            scale_increment: default_scale_increment(),
            scale_down_threshold: None,
            cooldown_seconds: default_cooldown(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

fn default_pool_repo() -> String {
    "*".into()
}

fn default_min_runners() -> u32 {
    5
}

fn default_max_runners() -> u32 {
    50
}

fn default_scale_threshold() -> f64 {
    0.8
}

fn default_scale_increment() -> u32 {
    5
}

fn default_cooldown() -> u64 {
    300
}

fn default_idle_timeout() -> u64 {
    1800
}

/// Job delegation configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfiguration {
    /// Seconds a job may sit Assigned before being requeued
    #[serde(default = "default_assignment_timeout")]
    pub assignment_timeout_seconds: u64,
}

impl Default for DispatchConfiguration {
    fn default() -> Self {
        Self {
            assignment_timeout_seconds: default_assignment_timeout(),
        }
    }
}

fn default_assignment_timeout() -> u64 {
    120
}

/// Durable state configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfiguration {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfiguration {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from(".fleet/state.db")
}
