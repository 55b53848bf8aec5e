//! Fleet manager: the collection of runners and their containers

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Configuration;
use crate::database::Database;
use crate::docker::{ContainerDriver, ExecOptions, ExecOutput};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::provider::{ProviderClient, ProviderRunnerStatus};
use crate::registry::Registry;
use crate::system::Locker;
use crate::types::{
    generate_runner_name, ContainerRecord, DesiredState, ObservedState, ResourceSample, Runner,
    RunnerStatus,
};

use super::{lifecycle, sampler};

/// Manager for all runners owned by this daemon
pub struct FleetManager {
    config: Arc<Configuration>,
    driver: Arc<dyn ContainerDriver>,
    provider: Arc<dyn ProviderClient>,
    registry: Arc<Registry>,
    db: Arc<Database>,
    events: EventBus,

    /// Container records, exclusively owned here, keyed by container id
    containers: DashMap<String, ContainerRecord>,

    /// Per-runner transition locks
    locks: DashMap<String, Arc<Locker>>,

    /// Sampler tasks keyed by container id
    samplers: DashMap<String, (CancellationToken, JoinHandle<()>)>,

    /// Cancels every sampler on shutdown
    shutdown_token: CancellationToken,
}

impl FleetManager {
    pub fn new(
        config: Arc<Configuration>,
        driver: Arc<dyn ContainerDriver>,
        provider: Arc<dyn ProviderClient>,
        registry: Arc<Registry>,
        db: Arc<Database>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            driver,
            provider,
            registry,
            db,
            events,
            containers: DashMap::new(),
            locks: DashMap::new(),
            samplers: DashMap::new(),
            shutdown_token: CancellationToken::new(),
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub(super) fn driver(&self) -> &Arc<dyn ContainerDriver> {
        &self.driver
    }

    pub(super) fn provider(&self) -> &Arc<dyn ProviderClient> {
        &self.provider
    }

    /// Latest record for a container, if tracked
    pub fn container(&self, container_id: &str) -> Option<ContainerRecord> {
        self.containers.get(container_id).map(|r| r.clone())
    }

    pub(super) fn insert_container(&self, record: ContainerRecord) {
        self.containers.insert(record.id.clone(), record);
    }

    pub(super) fn drop_container(&self, container_id: &str) {
        self.containers.remove(container_id);
    }

    pub(super) fn update_container(
        &self,
        container_id: &str,
        f: impl FnOnce(&mut ContainerRecord),
    ) {
        if let Some(mut record) = self.containers.get_mut(container_id) {
            f(record.value_mut());
        }
    }

    pub(super) fn with_container<T>(
        &self,
        container_id: &str,
        f: impl FnOnce(&mut ContainerRecord) -> T,
    ) -> Option<T> {
        self.containers
            .get_mut(container_id)
            .map(|mut record| f(record.value_mut()))
    }

    fn runner_lock(&self, name: &str) -> Arc<Locker> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Locker::new()))
            .clone()
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    /// Create, register and start a new runner for the given repository
    /// binding (None = unbound / default pool).
    pub async fn spawn_runner(self: &Arc<Self>, repository: Option<&str>) -> Result<Runner> {
        let name = generate_runner_name(&self.config.docker.runner.name_prefix);
        self.spawn_runner_named(name, repository).await
    }

    /// Spawn with a caller-chosen name; a retry with the same name is a
    /// no-op if the runner already exists.
    pub async fn spawn_runner_named(
        self: &Arc<Self>,
        name: String,
        repository: Option<&str>,
    ) -> Result<Runner> {
        let lock = self.runner_lock(&name);
        let _guard = lock
            .acquire()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        lifecycle::spawn(self, name, repository).await
    }

    /// Gracefully stop a runner and deregister it from the provider
    pub async fn stop_runner(&self, name: &str, graceful: Option<Duration>) -> Result<()> {
        let lock = self.runner_lock(name);
        let _guard = lock
            .acquire()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        lifecycle::stop(self, name, graceful).await
    }

    /// Remove a stopped runner's container and delete the runner
    pub async fn remove_runner(&self, name: &str, force: bool) -> Result<()> {
        let lock = self.runner_lock(name);
        let _guard = lock
            .acquire()
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        let result = lifecycle::remove(self, name, force).await;
        if result.is_ok() {
            self.locks.remove(name);
        }
        result
    }

    // ========================================================================
    // Admin surface
    // ========================================================================

    /// Runners known to the registry, optionally filtered by status
    pub fn list_runners(&self, status: Option<RunnerStatus>) -> Vec<Runner> {
        let mut runners: Vec<Runner> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|r| status.map(|s| r.status == s).unwrap_or(true))
            .collect();
        runners.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        runners
    }

    /// Run a command inside a runner's container
    pub async fn exec_in_runner(
        &self,
        name: &str,
        argv: &[String],
        opts: &ExecOptions,
    ) -> Result<ExecOutput> {
        let runner = self
            .registry
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("runner {}", name)))?;
        let container_id = runner
            .container_id
            .ok_or_else(|| Error::PreconditionFailed(format!("runner {} has no container", name)))?;

        Ok(self.driver.exec(&container_id, argv, opts).await?)
    }

    /// Latest smoothed sample for a runner, falling back to a fresh poll
    pub async fn runner_stats(&self, name: &str) -> Result<ResourceSample> {
        let runner = self
            .registry
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("runner {}", name)))?;
        let container_id = runner
            .container_id
            .ok_or_else(|| Error::PreconditionFailed(format!("runner {} has no container", name)))?;

        if let Some(sample) = self.container(&container_id).and_then(|r| r.sample) {
            return Ok(sample);
        }
        Ok(self.driver.stats(&container_id).await?)
    }

    /// Stop and remove every runner bound to the given scope
    pub async fn drain_pool(&self, scope: &str) -> Result<u32> {
        let matches = |runner: &Runner| -> bool {
            match (&runner.repository, scope) {
                (_, "*") => true,
                (Some(repo), scope) => {
                    repo == scope
                        || glob::Pattern::new(scope)
                            .map(|p| p.matches(repo))
                            .unwrap_or(false)
                }
                (None, _) => false,
            }
        };

        let names: Vec<String> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(matches)
            .map(|r| r.name)
            .collect();

        let mut drained = 0;
        for name in &names {
            if let Err(e) = self.stop_runner(name, None).await {
                warn!("drain: stop of {} failed: {}", name, e);
                continue;
            }
            match self.remove_runner(name, false).await {
                Ok(()) => drained += 1,
                Err(e) => warn!("drain: remove of {} failed: {}", name, e),
            }
        }

        info!("drained {} runner(s) from scope {}", drained, scope);
        Ok(drained)
    }

    // ========================================================================
    // Provider synchronization and health
    // ========================================================================

    /// Refresh runner statuses from the provider listing.
    ///
    /// Online-and-free becomes Idle, online-and-busy becomes Busy; runners
    /// mid-transition (Stopping, Offline, Failed) are left alone. Listing
    /// failures are soft for callers: statuses simply go stale.
    pub async fn sync_provider_status(&self) -> Result<()> {
        let listed = self
            .provider
            .list_runners(&self.config.provider.repo)
            .await?;

        for provider_runner in listed {
            let Some(known) = self.registry.get(&provider_runner.name) else {
                continue;
            };

            if known.provider_id.is_none() {
                self.registry
                    .bind_provider(&known.name, provider_runner.id)?;
            }

            if provider_runner.status == ProviderRunnerStatus::Online {
                self.registry.heartbeat(&known.name)?;
            }

            let next = match (known.status, provider_runner.status, provider_runner.busy) {
                (
                    RunnerStatus::Starting | RunnerStatus::Idle | RunnerStatus::Busy,
                    ProviderRunnerStatus::Online,
                    true,
                ) => Some(RunnerStatus::Busy),
                (
                    RunnerStatus::Starting | RunnerStatus::Idle | RunnerStatus::Busy,
                    ProviderRunnerStatus::Online,
                    false,
                ) => Some(RunnerStatus::Idle),
                _ => None,
            };

            if let Some(next) = next {
                if next != known.status {
                    self.registry.set_status(&known.name, next)?;
                    self.events.publish_runner_state(&known.name, next);
                }
            }
        }

        Ok(())
    }

    /// Inspect every container we expect to be running and fail runners
    /// whose container crashed. The autoscaler replaces them via its
    /// min-floor rule after the crash event nudges it.
    pub async fn check_health(&self) {
        let expected: Vec<(String, String)> = self
            .containers
            .iter()
            .filter(|entry| entry.value().desired == DesiredState::Running)
            .map(|entry| (entry.key().clone(), entry.value().runner_name.clone()))
            .collect();

        for (container_id, runner_name) in expected {
            let observed = match self.driver.inspect(&container_id).await {
                Ok(state) => state,
                Err(e) => {
                    debug!("health inspect of {} failed: {}", container_id, e);
                    continue;
                }
            };

            self.update_container(&container_id, |record| {
                record.set_observed(observed);
            });

            if matches!(
                observed,
                ObservedState::Exited | ObservedState::Dead | ObservedState::Missing
            ) {
                let Some(runner) = self.registry.get(&runner_name) else {
                    continue;
                };
                if !matches!(
                    runner.status,
                    RunnerStatus::Starting | RunnerStatus::Idle | RunnerStatus::Busy
                ) {
                    continue;
                }

                self.stop_sampler(&container_id);

                // An ephemeral runner exiting while busy finished its one
                // job; that's retirement, not a crash. The cleanup sweep
                // deregisters and removes it.
                if self.config.docker.runner.ephemeral && runner.status == RunnerStatus::Busy {
                    info!(
                        "ephemeral runner {} completed its job and exited",
                        runner_name
                    );
                    let _ = self.registry.set_status(&runner_name, RunnerStatus::Offline);
                    self.events
                        .publish_runner_state(&runner_name, RunnerStatus::Offline);
                    continue;
                }

                error!(
                    "container {} for runner {} crashed ({:?})",
                    container_id, runner_name, observed
                );
                let _ = self.registry.set_status(&runner_name, RunnerStatus::Failed);
                self.events
                    .publish_runner_state(&runner_name, RunnerStatus::Failed);
                self.events.publish(crate::events::Event::RunnerCrashed {
                    name: runner_name.clone(),
                    exit_code: -1,
                });
            }
        }
    }

    /// Periodic cleanup: health check, deregistration retries, stuck
    /// Stopping runners, failed-runner teardown and orphaned containers.
    pub async fn cleanup_sweep(&self) {
        self.check_health().await;

        for runner in self.registry.snapshot() {
            match runner.status {
                // At-least-once deregistration for runners that stopped but
                // whose provider-side delete failed
                RunnerStatus::Offline if runner.provider_id.is_some() => {
                    let repo = self.config.provider.repo.clone();
                    match self
                        .provider
                        .delete_runner(&repo, runner.provider_id.unwrap_or_default())
                        .await
                    {
                        Ok(()) => {
                            let _ = self.registry.clear_provider(&runner.name);
                            debug!("late deregistration of {} succeeded", runner.name);
                        }
                        Err(e) => {
                            warn!("deregistration retry for {} failed: {}", runner.name, e)
                        }
                    }
                }
                // Scale-down failures leave runners Stopping; drive them on
                RunnerStatus::Stopping => {
                    if let Err(e) = self.stop_runner(&runner.name, None).await {
                        warn!("cleanup stop of {} failed: {}", runner.name, e);
                        continue;
                    }
                    if let Err(e) = self.remove_runner(&runner.name, false).await {
                        warn!("cleanup remove of {} failed: {}", runner.name, e);
                    }
                }
                // Failed runners are torn down; the pool minimum respawns
                // capacity through the autoscaler
                RunnerStatus::Failed => {
                    if let Err(e) = self.stop_runner(&runner.name, None).await {
                        warn!("cleanup stop of failed {} errored: {}", runner.name, e);
                        continue;
                    }
                    if let Err(e) = self.remove_runner(&runner.name, true).await {
                        warn!("cleanup remove of failed {} errored: {}", runner.name, e);
                    }
                }
                _ => {}
            }
        }

        // Containers carrying our label but unknown to the registry are
        // orphans from an earlier life; remove them.
        match self.driver.list_owned().await {
            Ok(owned) => {
                for container in owned {
                    if !self.registry.contains(&container.runner_name) {
                        info!(
                            "removing orphan container {} (runner {})",
                            container.id, container.runner_name
                        );
                        if let Err(e) = self.driver.remove(&container.id, true).await {
                            warn!("orphan removal of {} failed: {}", container.id, e);
                        }
                        self.drop_container(&container.id);
                    }
                }
            }
            Err(e) => debug!("orphan sweep listing failed: {}", e),
        }
    }

    // ========================================================================
    // Reconcile
    // ========================================================================

    /// Bring the registry, durable store, provider inventory and container
    /// runtime into agreement. Called at boot and from the admin surface.
    ///
    /// Rules, per runner name:
    /// - in DB but not at the provider: delete the DB row
    /// - in DB and at the provider but no container: deregister, delete row
    /// - container plus provider record (with or without a DB row): adopt
    /// - container only: remove it from the runtime
    pub async fn reconcile(self: &Arc<Self>) -> Result<()> {
        let db_rows = self.db.list_runners().await?;
        let provider_runners = self
            .provider
            .list_runners(&self.config.provider.repo)
            .await?;
        let runtime = self.driver.list_owned().await?;

        let provider_by_name: std::collections::HashMap<&str, _> = provider_runners
            .iter()
            .map(|r| (r.name.as_str(), r))
            .collect();
        let runtime_by_name: std::collections::HashMap<&str, _> =
            runtime.iter().map(|c| (c.runner_name.as_str(), c)).collect();
        let db_names: std::collections::HashSet<&str> =
            db_rows.iter().map(|r| r.name.as_str()).collect();

        let mut adopted = 0u32;

        for row in &db_rows {
            match (
                provider_by_name.get(row.name.as_str()),
                runtime_by_name.get(row.name.as_str()),
            ) {
                (None, None) => {
                    info!("reconcile: dropping stale DB row for {}", row.name);
                    let _ = self.db.delete_runner(&row.name).await;
                }
                (None, Some(container)) => {
                    // Provider forgot the runner; its container is useless
                    info!(
                        "reconcile: removing container {} for deregistered {}",
                        container.id, row.name
                    );
                    let _ = self.driver.remove(&container.id, true).await;
                    let _ = self.db.delete_runner(&row.name).await;
                }
                (Some(provider_runner), None) => {
                    info!(
                        "reconcile: deregistering {} (no container backs it)",
                        row.name
                    );
                    let repo = self.config.provider.repo.clone();
                    if let Err(e) = self.provider.delete_runner(&repo, provider_runner.id).await {
                        warn!("reconcile deregistration of {} failed: {}", row.name, e);
                    }
                    let _ = self.db.delete_runner(&row.name).await;
                }
                (Some(provider_runner), Some(container)) => {
                    self.adopt(row.clone(), provider_runner, container)?;
                    adopted += 1;
                }
            }
        }

        // Containers the runtime knows that the DB does not
        for container in &runtime {
            if db_names.contains(container.runner_name.as_str()) {
                continue;
            }
            match provider_by_name.get(container.runner_name.as_str()) {
                Some(provider_runner) => {
                    // Registered and running, just unrecorded; adopt it
                    let row = Runner::new(
                        container.runner_name.clone(),
                        container.repository.clone(),
                        self.config.docker.runner.labels.clone(),
                    );
                    self.adopt(row, provider_runner, container)?;
                    adopted += 1;
                }
                None => {
                    info!("reconcile: removing orphan container {}", container.id);
                    if let Err(e) = self.driver.remove(&container.id, true).await {
                        warn!("reconcile orphan removal failed: {}", e);
                    }
                }
            }
        }

        info!("reconcile complete, {} runner(s) adopted", adopted);
        Ok(())
    }

    /// Re-adopt a surviving runner into the registry and restart sampling
    fn adopt(
        self: &Arc<Self>,
        mut runner: Runner,
        provider_runner: &crate::provider::ProviderRunner,
        container: &crate::docker::OwnedContainer,
    ) -> Result<()> {
        runner.provider_id = Some(provider_runner.id);
        runner.container_id = Some(container.id.clone());
        runner.status = match (provider_runner.status, provider_runner.busy) {
            (ProviderRunnerStatus::Online, true) => RunnerStatus::Busy,
            (ProviderRunnerStatus::Online, false) => RunnerStatus::Idle,
            // Give the runner a chance to come online; the health check
            // fails it if the container is actually dead
            (ProviderRunnerStatus::Offline, _) => RunnerStatus::Starting,
        };
        if runner.status == RunnerStatus::Idle {
            runner.idle_since = Some(chrono::Utc::now());
        }

        let mut record = ContainerRecord::new(
            container.id.clone(),
            runner.name.clone(),
            runner.repository.clone(),
            container.image.clone(),
            runner.labels.clone(),
        );
        record.set_desired(DesiredState::Running);
        record.set_observed(container.observed);
        self.insert_container(record);

        if self.registry.contains(&runner.name) {
            return Ok(());
        }
        let name = runner.name.clone();
        let container_id = container.id.clone();
        self.registry.insert(runner)?;
        debug!("reconcile: adopted runner {}", name);

        if container.observed == ObservedState::Running {
            self.start_sampler(&container_id);
        }
        Ok(())
    }

    // ========================================================================
    // Samplers
    // ========================================================================

    /// Start the sampling task for a running container
    pub(super) fn start_sampler(self: &Arc<Self>, container_id: &str) {
        if self.samplers.contains_key(container_id) {
            return;
        }

        let interval = Duration::from_secs(self.config.docker.stats_interval_seconds);
        let token = self.shutdown_token.child_token();
        let id = container_id.to_string();

        let handle = tokio::spawn(sampler::run(
            self.clone(),
            id.clone(),
            interval,
            token.clone(),
        ));
        self.samplers.insert(id, (token, handle));
    }

    pub(super) fn stop_sampler(&self, container_id: &str) {
        if let Some((_, (token, _handle))) = self.samplers.remove(container_id) {
            token.cancel();
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop every runner with a bounded grace period, force-removing
    /// whatever is left when it expires.
    pub async fn shutdown(&self, grace: Duration) {
        info!("shutting down fleet, grace {:?}", grace);
        self.shutdown_token.cancel();

        let names: Vec<String> = self.registry.snapshot().into_iter().map(|r| r.name).collect();
        let semaphore = Arc::new(Semaphore::new(num_cpus::get()));

        let stop_all = async {
            let futures = names.iter().map(|name| {
                let semaphore = semaphore.clone();
                async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    if let Err(e) = self.stop_runner(name, None).await {
                        warn!("shutdown stop of {} failed: {}", name, e);
                        return;
                    }
                    if let Err(e) = self.remove_runner(name, false).await {
                        warn!("shutdown remove of {} failed: {}", name, e);
                    }
                }
            });
            futures_util::future::join_all(futures).await;
        };

        if tokio::time::timeout(grace, stop_all).await.is_err() {
            warn!("shutdown grace expired, force-removing remaining containers");
            for runner in self.registry.snapshot() {
                if let Some(container_id) = &runner.container_id {
                    let _ = self.driver.remove(container_id, true).await;
                }
                self.registry.remove(&runner.name);
            }
        }

        info!("fleet shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_config, FakeDriver, FakeProvider};

    fn fleet_with_fakes() -> (
        Arc<FleetManager>,
        Arc<FakeProvider>,
        Arc<FakeDriver>,
        Arc<Registry>,
        Arc<Database>,
    ) {
        let provider = FakeProvider::new();
        let driver = FakeDriver::with_provider(provider.clone());
        let (registry, _changes) = Registry::new();
        let registry = Arc::new(registry);
        let db = Arc::new(Database::open_in_memory().unwrap());
        let fleet = FleetManager::new(
            Arc::new(test_config()),
            driver.clone(),
            provider.clone(),
            registry.clone(),
            db.clone(),
            EventBus::new(),
        );
        (fleet, provider, driver, registry, db)
    }

    #[tokio::test]
    async fn test_spawn_creates_container_and_registers() {
        let (fleet, provider, driver, registry, _db) = fleet_with_fakes();

        let runner = fleet.spawn_runner(None).await.unwrap();
        assert_eq!(runner.status, RunnerStatus::Starting);
        assert_eq!(provider.minted.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Container exists, runs, and carries the registration token in env
        let container = driver.container_by_name(&runner.name).unwrap();
        assert_eq!(container.observed, ObservedState::Running);
        assert!(container.env.contains_key("RUNNER_TOKEN"));
        assert_eq!(container.env.get("RUNNER_NAME"), Some(&runner.name));

        // Once the provider lists it online, the runner becomes Idle
        fleet.sync_provider_status().await.unwrap();
        let synced = registry.get(&runner.name).unwrap();
        assert_eq!(synced.status, RunnerStatus::Idle);
        assert!(synced.provider_id.is_some());
    }

    #[tokio::test]
    async fn test_spawn_is_idempotent_by_name() {
        let (fleet, _provider, driver, registry, _db) = fleet_with_fakes();

        let first = fleet
            .spawn_runner_named("runner-1-fixed".into(), None)
            .await
            .unwrap();
        let second = fleet
            .spawn_runner_named("runner-1-fixed".into(), None)
            .await
            .unwrap();

        assert_eq!(first.name, second.name);
        assert_eq!(driver.created.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_two_spawns_get_distinct_names() {
        let (fleet, _provider, _driver, registry, _db) = fleet_with_fakes();

        let a = fleet.spawn_runner(None).await.unwrap();
        let b = fleet.spawn_runner(None).await.unwrap();

        assert_ne!(a.name, b.name);
        assert!(registry.contains(&a.name));
        assert!(registry.contains(&b.name));
    }

    #[tokio::test]
    async fn test_spawn_rolls_back_on_start_failure() {
        let (fleet, provider, driver, registry, _db) = fleet_with_fakes();
        driver
            .fail_start
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let result = fleet.spawn_runner(None).await;
        assert!(result.is_err());

        // Token was minted once and discarded; the partial container is gone
        assert_eq!(provider.minted.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(driver.container_count(), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stop_deregisters_after_container_stopped() {
        let (fleet, provider, driver, registry, _db) = fleet_with_fakes();

        let runner = fleet.spawn_runner(None).await.unwrap();
        fleet.sync_provider_status().await.unwrap();
        assert!(provider.contains(&runner.name));

        fleet.stop_runner(&runner.name, None).await.unwrap();

        // Container stopped, provider record deleted, runner settled Offline
        let container = driver.container_by_name(&runner.name).unwrap();
        assert_eq!(container.observed, ObservedState::Exited);
        assert!(!provider.contains(&runner.name));
        let stopped = registry.get(&runner.name).unwrap();
        assert_eq!(stopped.status, RunnerStatus::Offline);
        assert!(stopped.provider_id.is_none());
    }

    #[tokio::test]
    async fn test_remove_after_stop_and_reinvocation() {
        let (fleet, _provider, driver, registry, _db) = fleet_with_fakes();

        let runner = fleet.spawn_runner(None).await.unwrap();
        fleet.sync_provider_status().await.unwrap();

        fleet.stop_runner(&runner.name, None).await.unwrap();
        fleet.remove_runner(&runner.name, false).await.unwrap();
        assert!(!registry.contains(&runner.name));
        assert_eq!(driver.container_count(), 0);

        // Re-invocation is a no-op success
        fleet.remove_runner(&runner.name, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_requires_stopped_container() {
        let (fleet, _provider, _driver, _registry, _db) = fleet_with_fakes();

        let runner = fleet.spawn_runner(None).await.unwrap();
        let err = fleet.remove_runner(&runner.name, false).await.unwrap_err();
        assert_eq!(err.kind(), "precondition_failed");

        // Force bypasses the check
        fleet.remove_runner(&runner.name, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_deregistration_retried_by_sweep() {
        let (fleet, provider, _driver, registry, _db) = fleet_with_fakes();

        let runner = fleet.spawn_runner(None).await.unwrap();
        fleet.sync_provider_status().await.unwrap();

        provider
            .fail_deletion
            .store(true, std::sync::atomic::Ordering::SeqCst);
        fleet.stop_runner(&runner.name, None).await.unwrap();

        // Offline but still holding the provider id for the retry
        let stuck = registry.get(&runner.name).unwrap();
        assert_eq!(stuck.status, RunnerStatus::Offline);
        assert!(stuck.provider_id.is_some());

        provider
            .fail_deletion
            .store(false, std::sync::atomic::Ordering::SeqCst);
        fleet.cleanup_sweep().await;

        assert!(registry.get(&runner.name).unwrap().provider_id.is_none());
        assert!(!provider.contains(&runner.name));
    }

    #[tokio::test]
    async fn test_crash_marks_runner_failed_and_notifies() {
        let (fleet, _provider, driver, registry, _db) = fleet_with_fakes();
        let mut events = fleet.events().subscribe();

        let runner = fleet.spawn_runner(None).await.unwrap();
        fleet.sync_provider_status().await.unwrap();

        let container = driver.container_by_name(&runner.name).unwrap();
        driver.set_observed(&container.id, ObservedState::Exited);
        fleet.check_health().await;

        assert_eq!(
            registry.get(&runner.name).unwrap().status,
            RunnerStatus::Failed
        );

        let mut saw_crash = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, crate::events::Event::RunnerCrashed { .. }) {
                saw_crash = true;
            }
        }
        assert!(saw_crash);
    }

    #[tokio::test]
    async fn test_ephemeral_busy_exit_is_retirement_not_crash() {
        let (fleet, _provider, driver, registry, _db) = fleet_with_fakes();

        let runner = fleet.spawn_runner(None).await.unwrap();
        fleet.sync_provider_status().await.unwrap();
        registry.try_assign(&runner.name).unwrap();

        let container = driver.container_by_name(&runner.name).unwrap();
        driver.set_observed(&container.id, ObservedState::Exited);
        fleet.check_health().await;

        assert_eq!(
            registry.get(&runner.name).unwrap().status,
            RunnerStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_reconcile_after_restart() {
        let (fleet, provider, driver, registry, db) = fleet_with_fakes();

        // DB knows {A, B, C}; provider knows {B, C, D}; runtime has {C, D, E}
        for name in ["runner-a", "runner-b", "runner-c"] {
            db.upsert_runner(&Runner::new(name.into(), None, vec![]))
                .await
                .unwrap();
        }
        provider.register("runner-b", true, false);
        provider.register("runner-c", true, false);
        provider.register("runner-d", true, true);
        driver.seed("ctr-c", "runner-c", ObservedState::Running);
        driver.seed("ctr-d", "runner-d", ObservedState::Running);
        driver.seed("ctr-e", "runner-e", ObservedState::Running);

        fleet.reconcile().await.unwrap();

        // {C, D} tracked
        assert!(registry.contains("runner-c"));
        assert!(registry.contains("runner-d"));
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get("runner-c").unwrap().status,
            RunnerStatus::Idle
        );
        assert_eq!(
            registry.get("runner-d").unwrap().status,
            RunnerStatus::Busy
        );

        // A dropped from the DB, B deregistered at the provider
        let rows = db.list_runners().await.unwrap();
        assert!(!rows.iter().any(|r| r.name == "runner-a"));
        assert!(!rows.iter().any(|r| r.name == "runner-b"));
        assert!(!provider.contains("runner-b"));

        // E removed from the runtime
        assert!(driver.container_by_name("runner-e").is_none());
        assert!(driver.container_by_name("runner-c").is_some());
        assert!(driver.container_by_name("runner-d").is_some());
    }

    #[tokio::test]
    async fn test_exec_and_stats_verbs() {
        let (fleet, _provider, _driver, _registry, _db) = fleet_with_fakes();

        let runner = fleet.spawn_runner(None).await.unwrap();

        let output = fleet
            .exec_in_runner(
                &runner.name,
                &["echo".to_string(), "hi".to_string()],
                &crate::docker::ExecOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.contains("echo hi"));

        let sample = fleet.runner_stats(&runner.name).await.unwrap();
        assert!(sample.memory_bytes > 0);

        let err = fleet.runner_stats("runner-missing").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_drain_pool_empties_scope() {
        let (fleet, _provider, driver, registry, _db) = fleet_with_fakes();

        fleet.spawn_runner(None).await.unwrap();
        fleet.spawn_runner(None).await.unwrap();
        fleet.sync_provider_status().await.unwrap();

        let drained = fleet.drain_pool("*").await.unwrap();
        assert_eq!(drained, 2);
        assert!(registry.is_empty());
        assert_eq!(driver.container_count(), 0);
    }

    #[tokio::test]
    async fn test_orphan_containers_are_swept() {
        let (fleet, _provider, driver, _registry, _db) = fleet_with_fakes();

        driver.seed("ctr-x", "runner-long-gone", ObservedState::Exited);
        fleet.cleanup_sweep().await;

        assert!(driver.container_by_name("runner-long-gone").is_none());
    }
}
