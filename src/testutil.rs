//! In-memory fakes for the provider client and container driver
//!
//! Both external collaborators are capability traits, so tests exercise the
//! real manager / autoscaler / dispatcher code against these fakes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::docker::{
    ContainerDriver, ContainerSpec, DriverError, DriverResult, ExecOptions, ExecOutput,
    OwnedContainer,
};
use crate::provider::{
    ProviderClient, ProviderError, ProviderResult, ProviderRunner, ProviderRunnerStatus,
    RegistrationToken,
};
use crate::types::{ObservedState, ResourceSample};

// ============================================================================
// Provider fake
// ============================================================================

#[derive(Default)]
pub struct FakeProvider {
    runners: Mutex<HashMap<String, ProviderRunner>>,
    next_id: AtomicI64,
    pub minted: AtomicU32,
    pub deleted: AtomicU32,
    pub list_calls: AtomicU32,
    pub fail_listing: AtomicBool,
    pub fail_minting: AtomicBool,
    pub fail_deletion: AtomicBool,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a runner as the container-side agent would after consuming
    /// its token
    pub fn register(&self, name: &str, online: bool, busy: bool) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.runners.lock().insert(
            name.to_string(),
            ProviderRunner {
                id,
                name: name.to_string(),
                status: if online {
                    ProviderRunnerStatus::Online
                } else {
                    ProviderRunnerStatus::Offline
                },
                busy,
            },
        );
    }

    pub fn set_busy(&self, name: &str, busy: bool) {
        if let Some(runner) = self.runners.lock().get_mut(name) {
            runner.busy = busy;
        }
    }

    pub fn set_online(&self, name: &str, online: bool) {
        if let Some(runner) = self.runners.lock().get_mut(name) {
            runner.status = if online {
                ProviderRunnerStatus::Online
            } else {
                ProviderRunnerStatus::Offline
            };
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.runners.lock().contains_key(name)
    }
}

#[async_trait]
impl ProviderClient for FakeProvider {
    async fn list_runners(&self, _repo: &str) -> ProviderResult<Vec<ProviderRunner>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(ProviderError::Timeout);
        }
        Ok(self.runners.lock().values().cloned().collect())
    }

    async fn mint_registration_token(&self, _repo: &str) -> ProviderResult<RegistrationToken> {
        if self.fail_minting.load(Ordering::SeqCst) {
            return Err(ProviderError::Timeout);
        }
        let n = self.minted.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RegistrationToken::for_tests(&format!("fake-token-{}", n)))
    }

    async fn delete_runner(&self, _repo: &str, provider_runner_id: i64) -> ProviderResult<()> {
        if self.fail_deletion.load(Ordering::SeqCst) {
            return Err(ProviderError::Timeout);
        }
        self.deleted.fetch_add(1, Ordering::SeqCst);
        // Absent runners are success, like the real endpoint's 404
        self.runners
            .lock()
            .retain(|_, runner| runner.id != provider_runner_id);
        Ok(())
    }
}

// ============================================================================
// Driver fake
// ============================================================================

#[derive(Clone)]
pub struct FakeContainer {
    pub id: String,
    pub runner_name: String,
    pub repository: Option<String>,
    pub image: String,
    pub env: HashMap<String, String>,
    pub observed: ObservedState,
}

#[derive(Default)]
pub struct FakeDriver {
    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: AtomicU64,
    /// When set, starting a container registers its runner online with the
    /// provider, emulating the agent consuming its token
    provider: Mutex<Option<Arc<FakeProvider>>>,
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_stats: AtomicBool,
    pub created: AtomicU32,
    pub removed: AtomicU32,
}

impl FakeDriver {
    pub fn with_provider(provider: Arc<FakeProvider>) -> Arc<Self> {
        let driver = Self::default();
        *driver.provider.lock() = Some(provider);
        Arc::new(driver)
    }

    pub fn container_by_name(&self, runner_name: &str) -> Option<FakeContainer> {
        self.containers
            .lock()
            .values()
            .find(|c| c.runner_name == runner_name)
            .cloned()
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().len()
    }

    pub fn set_observed(&self, id: &str, observed: ObservedState) {
        if let Some(container) = self.containers.lock().get_mut(id) {
            container.observed = observed;
        }
    }

    /// Seed a container directly, as reconcile tests need
    pub fn seed(&self, id: &str, runner_name: &str, observed: ObservedState) {
        self.containers.lock().insert(
            id.to_string(),
            FakeContainer {
                id: id.to_string(),
                runner_name: runner_name.to_string(),
                repository: None,
                image: "ci-runner:latest".into(),
                env: HashMap::new(),
                observed,
            },
        );
    }
}

#[async_trait]
impl ContainerDriver for FakeDriver {
    async fn create(&self, spec: &ContainerSpec) -> DriverResult<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(DriverError::Timeout);
        }

        let mut containers = self.containers.lock();
        if containers.values().any(|c| c.runner_name == spec.name) {
            return Err(DriverError::Conflict(spec.name.clone()));
        }

        let id = format!("ctr-{:04}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                runner_name: spec.name.clone(),
                repository: spec.repository.clone(),
                image: spec.image.clone(),
                env: spec.env.clone(),
                observed: ObservedState::Created,
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn start(&self, id: &str) -> DriverResult<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(DriverError::Timeout);
        }

        let runner_name = {
            let mut containers = self.containers.lock();
            let container = containers
                .get_mut(id)
                .ok_or_else(|| DriverError::NotFound(id.to_string()))?;
            container.observed = ObservedState::Running;
            container.runner_name.clone()
        };

        if let Some(provider) = self.provider.lock().clone() {
            provider.register(&runner_name, true, false);
        }
        Ok(())
    }

    async fn stop(&self, id: &str, _graceful: Duration) -> DriverResult<()> {
        let runner_name = {
            let mut containers = self.containers.lock();
            match containers.get_mut(id) {
                Some(container) => {
                    container.observed = ObservedState::Exited;
                    Some(container.runner_name.clone())
                }
                // Already gone counts as stopped
                None => None,
            }
        };

        if let (Some(name), Some(provider)) = (runner_name, self.provider.lock().clone()) {
            provider.set_online(&name, false);
        }
        Ok(())
    }

    async fn remove(&self, id: &str, _force: bool) -> DriverResult<()> {
        self.containers.lock().remove(id);
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> DriverResult<ObservedState> {
        Ok(self
            .containers
            .lock()
            .get(id)
            .map(|c| c.observed)
            .unwrap_or(ObservedState::Missing))
    }

    async fn stats(&self, id: &str) -> DriverResult<ResourceSample> {
        if self.fail_stats.load(Ordering::SeqCst) {
            return Err(DriverError::Timeout);
        }
        if !self.containers.lock().contains_key(id) {
            return Err(DriverError::NotFound(id.to_string()));
        }
        Ok(ResourceSample {
            cpu_percent: 10.0,
            memory_bytes: 64 * 1024 * 1024,
            net_rx_bytes: 1000,
            net_tx_bytes: 2000,
        })
    }

    async fn exec(
        &self,
        id: &str,
        argv: &[String],
        _opts: &ExecOptions,
    ) -> DriverResult<ExecOutput> {
        if !self.containers.lock().contains_key(id) {
            return Err(DriverError::NotFound(id.to_string()));
        }
        Ok(ExecOutput {
            stdout: format!("ran: {}", argv.join(" ")),
            stderr: String::new(),
            exit_code: 0,
            truncated: false,
        })
    }

    async fn list_owned(&self) -> DriverResult<Vec<OwnedContainer>> {
        Ok(self
            .containers
            .lock()
            .values()
            .map(|c| OwnedContainer {
                id: c.id.clone(),
                runner_name: c.runner_name.clone(),
                repository: c.repository.clone(),
                image: c.image.clone(),
                observed: c.observed,
            })
            .collect())
    }
}

// ============================================================================
// Wiring helpers
// ============================================================================

/// A configuration valid for tests: credentials set, tiny pool, fast ticks
pub fn test_config() -> crate::config::Configuration {
    let mut config = crate::config::Configuration::default();
    config.provider.token = "test-token".into();
    config.provider.org = "acme".into();
    config.provider.repo = "widgets".into();
    config.docker.runner.image = "ci-runner:latest".into();
    config.docker.runner.labels = vec!["linux".into(), "x64".into()];
    config
}
