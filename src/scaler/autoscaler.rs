//! Autoscaling control loop

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::database::Database;
use crate::events::{DemandHint, Event, EventBus};
use crate::fleet::FleetManager;
use crate::system::{Locker, TaskGroup};
use crate::types::Runner;

use super::events::{ScaleReason, ScalingEvent, ScalingKind};
use super::metrics::MetricsSnapshot;

/// Consecutive low-utilization ticks required before scaling down
const SCALE_DOWN_HYSTERESIS: u32 = 2;

/// Periodic scaling loop for one pool scope
pub struct Autoscaler {
    pool: RwLock<PoolConfig>,

    /// Scope globs of the other configured pools; the default pool only
    /// owns repositories none of these match
    sibling_scopes: Vec<String>,

    fleet: Arc<FleetManager>,
    events: EventBus,
    db: Arc<Database>,

    /// Guards against overlapping ticks on this pool
    scale_lock: Locker,

    /// Set whenever a non-skip action was taken
    last_scale_at: Mutex<Option<tokio::time::Instant>>,

    /// Consecutive ticks at or below the scale-down threshold
    low_util_ticks: AtomicU32,

    /// Demand hints from the dispatcher, drained each tick
    hints: Mutex<Vec<DemandHint>>,

    /// Wakes the loop ahead of schedule (crash replacement, demand)
    nudge: Notify,
}

impl Autoscaler {
    pub fn new(
        pool: PoolConfig,
        sibling_scopes: Vec<String>,
        fleet: Arc<FleetManager>,
        events: EventBus,
        db: Arc<Database>,
    ) -> Self {
        Self {
            pool: RwLock::new(pool),
            sibling_scopes,
            fleet,
            events,
            db,
            scale_lock: Locker::new(),
            last_scale_at: Mutex::new(None),
            low_util_ticks: AtomicU32::new(0),
            hints: Mutex::new(Vec::new()),
            nudge: Notify::new(),
        }
    }

    /// The pool scope this loop manages
    pub fn scope(&self) -> String {
        self.pool.read().repo.clone()
    }

    /// Replace the pool configuration (admin surface)
    pub fn update_pool(&self, pool: PoolConfig) {
        *self.pool.write() = pool;
    }

    /// Queue a demand hint and wake the loop
    pub fn push_hint(&self, hint: DemandHint) {
        self.hints.lock().push(hint);
        self.nudge.notify_one();
    }

    /// Wake the loop ahead of its interval
    pub fn request_tick(&self) {
        self.nudge.notify_one();
    }

    fn scope_matches(scope: &str, repo: &str) -> bool {
        scope == repo
            || glob::Pattern::new(scope)
                .map(|p| p.matches(repo))
                .unwrap_or(false)
    }

    /// Whether this pool is responsible for the given repository
    pub fn owns_repo(&self, repo: &str) -> bool {
        let scope = self.scope();
        if scope == "*" {
            !self
                .sibling_scopes
                .iter()
                .any(|s| Self::scope_matches(s, repo))
        } else {
            Self::scope_matches(&scope, repo)
        }
    }

    fn owns_runner(&self, runner: &Runner) -> bool {
        match &runner.repository {
            None => self.scope() == "*",
            Some(repo) => self.owns_repo(repo),
        }
    }

    /// Run one control-loop pass and return the recorded decision
    pub async fn tick(&self) -> ScalingEvent {
        // Step 1: mutual exclusion, then cooldown. An overlapping tick
        // returns Skipped without ever touching the provider.
        let _guard = match self.scale_lock.try_acquire_owned() {
            Ok(guard) => guard,
            Err(_) => {
                let count = self.owned_online_count();
                return self
                    .record(ScalingEvent::skipped(
                        &self.scope(),
                        ScaleReason::ScalingInProgress,
                        count,
                    ))
                    .await;
            }
        };

        let pool = self.pool.read().clone();

        let last_scale_at = *self.last_scale_at.lock();
        if let Some(last) = last_scale_at {
            if last.elapsed() < Duration::from_secs(pool.cooldown_seconds) {
                let count = self.owned_online_count();
                return self
                    .record(ScalingEvent::skipped(
                        &pool.repo,
                        ScaleReason::Cooldown,
                        count,
                    ))
                    .await;
            }
        }

        // Step 2: refresh runner statuses from the provider, then compute
        // metrics from the registry's online view.
        if let Err(e) = self.fleet.sync_provider_status().await {
            // Soft failure: decide on the stale view rather than spawning
            // against unknown state
            warn!("provider sync failed for pool {}: {}", pool.repo, e);
        }

        let owned: Vec<Runner> = self
            .fleet
            .registry()
            .snapshot()
            .into_iter()
            .filter(|r| self.owns_runner(r))
            .collect();
        let metrics = MetricsSnapshot::compute(owned);
        let utilization = metrics.utilization();
        let demand: Vec<DemandHint> = self.hints.lock().drain(..).collect();

        debug!(
            "pool {}: total={} busy={} idle={} utilization={:.2} hints={}",
            pool.repo,
            metrics.total,
            metrics.busy,
            metrics.idle,
            utilization,
            demand.len()
        );

        // Step 3: enforce the minimum floor
        if metrics.total < pool.min_runners {
            let want = pool.min_runners - metrics.total;
            let spawned = self.spawn_many(&pool, want).await;
            self.mark_scaled();
            let event =
                ScalingEvent::new(
                    &pool.repo,
                    ScalingKind::Up,
                    ScaleReason::MinFloor,
                    metrics.total,
                    metrics.total + spawned,
                );
            let event = if spawned < want {
                event.with_note(format!("requested {} spawned {}", want, spawned))
            } else {
                event
            };
            return self.record(event).await;
        }

        // Step 4: scale up on utilization or dispatcher demand
        if utilization >= pool.scale_threshold || !demand.is_empty() {
            if metrics.total >= pool.max_runners {
                return self
                    .record(ScalingEvent::skipped(
                        &pool.repo,
                        ScaleReason::MaxCap,
                        metrics.total,
                    ))
                    .await;
            }

            let headroom = pool.max_runners - metrics.total;
            let want = pool.scale_increment.min(headroom);
            let spawned = self.spawn_many(&pool, want).await;
            self.mark_scaled();

            let reason = if utilization >= pool.scale_threshold {
                ScaleReason::Utilization
            } else {
                ScaleReason::Demand
            };
            let mut event = ScalingEvent::new(
                &pool.repo,
                ScalingKind::Up,
                reason,
                metrics.total,
                metrics.total + spawned,
            );
            if pool.scale_increment > headroom {
                event = event.with_note("capped_at_max");
            }
            return self.record(event).await;
        }

        // Step 5: scale down on sustained low utilization
        if utilization <= pool.scale_down_threshold() {
            if metrics.total <= pool.min_runners {
                self.low_util_ticks.store(0, Ordering::SeqCst);
                return self
                    .record(ScalingEvent::skipped(
                        &pool.repo,
                        ScaleReason::MinFloor,
                        metrics.total,
                    ))
                    .await;
            }

            let streak = self.low_util_ticks.fetch_add(1, Ordering::SeqCst) + 1;
            if streak < SCALE_DOWN_HYSTERESIS {
                return self
                    .record(
                        ScalingEvent::skipped(&pool.repo, ScaleReason::NoAction, metrics.total)
                            .with_note("hysteresis"),
                    )
                    .await;
            }

            let removable = self.removal_candidates(&pool, &metrics);
            let budget = (metrics.total - pool.min_runners) as usize;
            let targets: Vec<String> = removable.into_iter().take(budget).collect();

            if targets.is_empty() {
                return self
                    .record(
                        ScalingEvent::skipped(&pool.repo, ScaleReason::NoAction, metrics.total)
                            .with_note("no_idle_candidates"),
                    )
                    .await;
            }

            let removed = self.retire_many(&pool, &targets).await;
            self.mark_scaled();
            return self
                .record(ScalingEvent::new(
                    &pool.repo,
                    ScalingKind::Down,
                    ScaleReason::LowUtilization,
                    metrics.total,
                    metrics.total - removed,
                ))
                .await;
        }

        // Step 6: nothing to do; utilization is in the comfortable band
        self.low_util_ticks.store(0, Ordering::SeqCst);
        self.record(ScalingEvent::skipped(
            &pool.repo,
            ScaleReason::NoAction,
            metrics.total,
        ))
        .await
    }

    /// Online count from the registry only, used when a tick must not call
    /// the provider
    fn owned_online_count(&self) -> u32 {
        self.fleet
            .registry()
            .snapshot()
            .iter()
            .filter(|r| r.status.is_online() && self.owns_runner(r))
            .count() as u32
    }

    fn mark_scaled(&self) {
        *self.last_scale_at.lock() = Some(tokio::time::Instant::now());
        self.low_util_ticks.store(0, Ordering::SeqCst);
    }

    /// Idle runners past the idle timeout, oldest heartbeat first
    fn removal_candidates(&self, pool: &PoolConfig, metrics: &MetricsSnapshot) -> Vec<String> {
        let now = chrono::Utc::now();
        let mut idle: Vec<&Runner> = metrics
            .runners
            .iter()
            .filter(|r| r.idle_seconds(now) >= pool.idle_timeout_seconds as i64)
            .collect();
        idle.sort_by_key(|r| r.last_heartbeat);
        idle.into_iter().map(|r| r.name.clone()).collect()
    }

    /// Launch `want` spawns with concurrency bounded by the increment.
    /// Partial success is success; failed spawns retry naturally via the
    /// next tick's utilization.
    async fn spawn_many(&self, pool: &PoolConfig, want: u32) -> u32 {
        let binding = if pool.repo == "*" {
            None
        } else {
            Some(pool.repo.clone())
        };

        let semaphore = Arc::new(Semaphore::new(pool.scale_increment.max(1) as usize));
        let futures = (0..want).map(|_| {
            let fleet = self.fleet.clone();
            let binding = binding.clone();
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                match fleet.spawn_runner(binding.as_deref()).await {
                    Ok(runner) => Some(runner.name),
                    Err(e) => {
                        warn!("spawn failed: {}", e);
                        None
                    }
                }
            }
        });

        let spawned = join_all(futures)
            .await
            .into_iter()
            .flatten()
            .count() as u32;

        if spawned > 0 {
            info!("pool {}: spawned {} runner(s)", pool.repo, spawned);
        }
        spawned
    }

    /// Stop and remove the given runners. Failures leave runners in
    /// Stopping; the cleanup sweep drives them to Removed later.
    async fn retire_many(&self, pool: &PoolConfig, names: &[String]) -> u32 {
        let mut removed = 0;
        for name in names {
            if let Err(e) = self.fleet.stop_runner(name, None).await {
                warn!("pool {}: stop of {} failed: {}", pool.repo, name, e);
                continue;
            }
            match self.fleet.remove_runner(name, false).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("pool {}: remove of {} failed: {}", pool.repo, name, e),
            }
        }

        if removed > 0 {
            info!("pool {}: retired {} runner(s)", pool.repo, removed);
        }
        removed
    }

    /// Persist and publish a scaling event, then hand it back
    async fn record(&self, event: ScalingEvent) -> ScalingEvent {
        if event.kind == ScalingKind::Skipped {
            debug!(
                "pool {}: skipped ({})",
                event.repo,
                event.reason.as_str()
            );
        } else {
            info!(
                "pool {}: {} ({}) {} -> {}",
                event.repo,
                event.kind.as_str(),
                event.reason.as_str(),
                event.pre_count,
                event.post_count
            );
        }

        if let Err(e) = self.db.record_scaling_event(&event).await {
            warn!("failed to persist scaling event: {}", e);
        }
        self.events.publish_scaling(event.clone());
        event
    }

    /// Start the periodic loop and its event listener on the task group
    pub fn start(self: &Arc<Self>, tasks: &TaskGroup, interval: Duration) {
        let scope = self.scope();

        // Control loop: interval ticks plus out-of-band nudges
        let scaler = self.clone();
        let token = tasks.token();
        tasks.spawn(format!("autoscaler:{}", scope), async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("autoscaler loop for {} stopping", scaler.scope());
                        return;
                    }
                    _ = ticker.tick() => {
                        scaler.tick().await;
                    }
                    _ = scaler.nudge.notified() => {
                        scaler.tick().await;
                    }
                }
            }
        });

        // Listener: crash notifications and demand hints arrive on the bus
        let scaler = self.clone();
        let token = tasks.token();
        let mut rx = self.events.subscribe();
        tasks.spawn(format!("autoscaler-events:{}", scope), async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    event = rx.recv() => match event {
                        Ok(Event::RunnerCrashed { name, .. }) => {
                            debug!("crash of {} nudges pool {}", name, scaler.scope());
                            scaler.nudge.notify_one();
                        }
                        Ok(Event::Demand(hint)) => {
                            if scaler.owns_repo(&hint.repository) {
                                scaler.push_hint(hint);
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(_) => return,
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::registry::Registry;
    use crate::testutil::{test_config, FakeDriver, FakeProvider};
    use crate::types::RunnerStatus;

    struct Harness {
        scaler: Arc<Autoscaler>,
        fleet: Arc<FleetManager>,
        provider: Arc<FakeProvider>,
        driver: Arc<FakeDriver>,
        registry: Arc<crate::registry::Registry>,
    }

    fn harness(pool: PoolConfig) -> Harness {
        let provider = FakeProvider::new();
        let driver = FakeDriver::with_provider(provider.clone());
        let (registry, _changes) = Registry::new();
        let registry = Arc::new(registry);
        let db = Arc::new(Database::open_in_memory().unwrap());
        let events = crate::events::EventBus::new();
        let fleet = FleetManager::new(
            Arc::new(test_config()),
            driver.clone(),
            provider.clone(),
            registry.clone(),
            db.clone(),
            events.clone(),
        );
        let scaler = Arc::new(Autoscaler::new(pool, vec![], fleet.clone(), events, db));
        Harness {
            scaler,
            fleet,
            provider,
            driver,
            registry,
        }
    }

    fn pool(min: u32, max: u32) -> PoolConfig {
        PoolConfig {
            repo: "*".into(),
            min_runners: min,
            max_runners: max,
            scale_threshold: 0.8,
            scale_increment: 5,
            scale_down_threshold: None,
            cooldown_seconds: 300,
            idle_timeout_seconds: 1800,
        }
    }

    /// Spawn `total` runners through the fleet and mark `busy` of them busy
    /// at the provider.
    async fn seed_runners(h: &Harness, total: u32, busy: u32) -> Vec<String> {
        let mut names = Vec::new();
        for _ in 0..total {
            names.push(h.fleet.spawn_runner(None).await.unwrap().name);
        }
        for name in names.iter().take(busy as usize) {
            h.provider.set_busy(name, true);
        }
        h.fleet.sync_provider_status().await.unwrap();
        names
    }

    #[tokio::test]
    async fn test_first_tick_fills_empty_pool_to_min() {
        let h = harness(pool(5, 50));

        let event = h.scaler.tick().await;

        assert_eq!(event.kind, ScalingKind::Up);
        assert_eq!(event.reason, ScaleReason::MinFloor);
        assert_eq!(event.pre_count, 0);
        assert_eq!(event.post_count, 5);
        assert_eq!(h.driver.container_count(), 5);
    }

    #[tokio::test]
    async fn test_scale_up_under_load() {
        let h = harness(pool(5, 50));
        seed_runners(&h, 10, 9).await;

        let event = h.scaler.tick().await;

        // 9/10 utilization crosses 0.8: exactly one increment of spawns
        assert_eq!(event.kind, ScalingKind::Up);
        assert_eq!(event.reason, ScaleReason::Utilization);
        assert_eq!(event.pre_count, 10);
        assert_eq!(event.post_count, 15);
        assert_eq!(h.driver.container_count(), 15);

        // lastScaleAt advanced: the immediate next tick hits the cooldown
        let next = h.scaler.tick().await;
        assert_eq!(next.kind, ScalingKind::Skipped);
        assert_eq!(next.reason, ScaleReason::Cooldown);
    }

    #[tokio::test]
    async fn test_scale_up_capped_at_max() {
        let h = harness(pool(5, 50));
        seed_runners(&h, 48, 40).await;

        let event = h.scaler.tick().await;

        assert_eq!(event.kind, ScalingKind::Up);
        assert_eq!(event.reason, ScaleReason::Utilization);
        assert_eq!(event.pre_count, 48);
        assert_eq!(event.post_count, 50);
        assert_eq!(event.note.as_deref(), Some("capped_at_max"));
        assert_eq!(h.driver.container_count(), 50);
    }

    #[tokio::test]
    async fn test_at_max_is_skipped() {
        let h = harness(pool(2, 6));
        seed_runners(&h, 6, 6).await;

        let event = h.scaler.tick().await;

        assert_eq!(event.kind, ScalingKind::Skipped);
        assert_eq!(event.reason, ScaleReason::MaxCap);
        assert_eq!(h.driver.container_count(), 6);
    }

    #[tokio::test]
    async fn test_scale_down_respects_minimum() {
        let h = harness(pool(5, 50));
        seed_runners(&h, 5, 0).await;

        let event = h.scaler.tick().await;

        assert_eq!(event.kind, ScalingKind::Skipped);
        assert_eq!(event.reason, ScaleReason::MinFloor);
        assert_eq!(h.driver.container_count(), 5);
    }

    #[tokio::test]
    async fn test_scale_down_removes_expired_idle_runner() {
        let h = harness(pool(5, 50));
        let names = seed_runners(&h, 6, 1).await;

        // The last-seeded runner has been idle past the timeout
        let victim = names.last().unwrap().clone();
        let long_ago = chrono::Utc::now() - chrono::Duration::seconds(3600);
        h.registry.set_idle_since(&victim, long_ago);
        h.registry.set_last_heartbeat(&victim, long_ago);

        // Hysteresis: the first low-utilization tick only counts
        let first = h.scaler.tick().await;
        assert_eq!(first.kind, ScalingKind::Skipped);
        assert_eq!(first.note.as_deref(), Some("hysteresis"));

        let second = h.scaler.tick().await;
        assert_eq!(second.kind, ScalingKind::Down);
        assert_eq!(second.reason, ScaleReason::LowUtilization);
        assert_eq!(second.pre_count, 6);
        assert_eq!(second.post_count, 5);
        assert!(!h.registry.contains(&victim));
        assert_eq!(h.driver.container_count(), 5);
    }

    #[tokio::test]
    async fn test_unhealthy_runner_is_replaced() {
        let h = harness(pool(5, 50));
        let names = seed_runners(&h, 5, 0).await;

        // One container dies; the health check fails the runner and the
        // cleanup sweep tears it down
        let container = h.driver.container_by_name(&names[0]).unwrap();
        h.driver
            .set_observed(&container.id, crate::types::ObservedState::Exited);
        h.provider.set_online(&names[0], false);
        h.fleet.check_health().await;
        assert_eq!(
            h.registry.get(&names[0]).unwrap().status,
            RunnerStatus::Failed
        );
        h.fleet.cleanup_sweep().await;

        // The pool is at 4 of 5: one spawn restores the floor
        let event = h.scaler.tick().await;
        assert_eq!(event.kind, ScalingKind::Up);
        assert_eq!(event.reason, ScaleReason::MinFloor);
        assert_eq!(event.pre_count, 4);
        assert_eq!(event.post_count, 5);
    }

    #[tokio::test]
    async fn test_overlapping_tick_skips_without_listing() {
        let h = harness(pool(1, 10));
        seed_runners(&h, 1, 0).await;
        let listings_before = h
            .provider
            .list_calls
            .load(std::sync::atomic::Ordering::SeqCst);

        // Simulate a tick in flight
        let guard = h.scaler.scale_lock.try_acquire_owned().unwrap();
        let event = h.scaler.tick().await;
        drop(guard);

        assert_eq!(event.kind, ScalingKind::Skipped);
        assert_eq!(event.reason, ScaleReason::ScalingInProgress);
        assert_eq!(
            h.provider
                .list_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            listings_before
        );
    }

    #[tokio::test]
    async fn test_demand_hint_scales_up_without_utilization() {
        let h = harness(pool(2, 10));
        seed_runners(&h, 2, 0).await;

        h.scaler.push_hint(DemandHint {
            repository: "acme/widgets".into(),
            labels: vec!["gpu".into()],
        });
        let event = h.scaler.tick().await;

        assert_eq!(event.kind, ScalingKind::Up);
        assert_eq!(event.reason, ScaleReason::Demand);
        assert_eq!(event.pre_count, 2);
        assert_eq!(event.post_count, 7);
    }

    #[tokio::test]
    async fn test_steady_state_is_no_action() {
        let h = harness(pool(2, 10));
        // 1 of 2 busy: utilization 0.5 sits between both thresholds
        seed_runners(&h, 2, 1).await;

        let event = h.scaler.tick().await;

        assert_eq!(event.kind, ScalingKind::Skipped);
        assert_eq!(event.reason, ScaleReason::NoAction);
    }

    #[tokio::test]
    async fn test_partial_spawn_failure_is_reported_as_success() {
        let h = harness(pool(3, 10));

        // Every create fails; the tick still completes and reports what
        // actually happened
        h.driver
            .fail_create
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let event = h.scaler.tick().await;

        assert_eq!(event.kind, ScalingKind::Up);
        assert_eq!(event.reason, ScaleReason::MinFloor);
        assert_eq!(event.post_count, 0);
        assert!(event.note.is_some());

        // The next tick retries naturally once the runtime recovers
        h.driver
            .fail_create
            .store(false, std::sync::atomic::Ordering::SeqCst);
        *h.scaler.last_scale_at.lock() = None;
        let retry = h.scaler.tick().await;
        assert_eq!(retry.kind, ScalingKind::Up);
        assert_eq!(retry.post_count, 3);
    }

    #[tokio::test]
    async fn test_pool_scope_ownership() {
        let pool_config = PoolConfig {
            repo: "acme/*".into(),
            ..pool(1, 5)
        };
        let h = harness(pool_config);

        assert!(h.scaler.owns_repo("acme/widgets"));
        assert!(!h.scaler.owns_repo("other/repo"));

        let mut bound = crate::types::Runner::new("r1".into(), Some("acme/widgets".into()), vec![]);
        bound.status = RunnerStatus::Idle;
        assert!(h.scaler.owns_runner(&bound));

        let unbound = crate::types::Runner::new("r2".into(), None, vec![]);
        assert!(!h.scaler.owns_runner(&unbound));
    }
}
