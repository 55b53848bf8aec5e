//! Main daemon command - wires the core together and runs until shutdown

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use fleet_daemon::config::Configuration;
use fleet_daemon::database::Database;
use fleet_daemon::dispatch::Dispatcher;
use fleet_daemon::docker::DockerDriver;
use fleet_daemon::events::EventBus;
use fleet_daemon::fleet::FleetManager;
use fleet_daemon::provider::HttpProviderClient;
use fleet_daemon::registry::{Registry, RegistryChange};
use fleet_daemon::scaler::Autoscaler;
use fleet_daemon::system::TaskGroup;

/// Run the daemon until a shutdown signal arrives
pub async fn run(config_path: &str) -> Result<()> {
    info!("loading configuration from {}", config_path);
    let config = Arc::new(Configuration::load(config_path)?);

    info!("  provider: {} ({}/{})", config.provider.url, config.provider.org, config.provider.repo);
    info!("  runner image: {}", config.docker.runner.image);
    info!("  pools: {}", config.scaling.pools.len());

    let db = Arc::new(Database::open(&config.database.path)?);

    // Pool configuration is mirrored durably so admin updates survive
    for pool in &config.scaling.pools {
        db.save_pool(pool).await?;
    }

    let events = EventBus::new();
    let (registry, changes_rx) = Registry::new();
    let registry = Arc::new(registry);

    let driver = Arc::new(DockerDriver::new(&config.docker)?);
    let provider = Arc::new(HttpProviderClient::new(&config.provider)?);

    let fleet = FleetManager::new(
        config.clone(),
        driver,
        provider,
        registry.clone(),
        db.clone(),
        events.clone(),
    );

    let tasks = TaskGroup::new();

    // Best-effort durable mirror of every registry mutation
    {
        let db = db.clone();
        let token = tasks.token();
        let mut rx = changes_rx;
        tasks.spawn("registry-persistence", async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    change = rx.recv() => match change {
                        Some(RegistryChange::Upserted(runner)) => {
                            if let Err(e) = db.upsert_runner(&runner).await {
                                warn!("runner row upsert failed: {}", e);
                            }
                        }
                        Some(RegistryChange::Removed { name }) => {
                            if let Err(e) = db.delete_runner(&name).await {
                                warn!("runner row delete failed: {}", e);
                            }
                        }
                        None => return,
                    }
                }
            }
        });
    }

    // Restart recovery: registry, durable store, provider and runtime must
    // agree before any scaling decision is made
    info!("reconciling state after startup...");
    fleet.reconcile().await?;
    info!("reconcile done, {} runner(s) tracked", registry.len());

    // Job delegation
    let dispatcher = Dispatcher::new(
        registry.clone(),
        db.clone(),
        events.clone(),
        Duration::from_secs(config.dispatch.assignment_timeout_seconds),
    );

    // Jobs that never reached a terminal state before the restart go back
    // into the queue
    for status in [
        fleet_daemon::types::JobStatus::Queued,
        fleet_daemon::types::JobStatus::Assigned,
    ] {
        for job in db.list_jobs_by_status(status).await? {
            if let Err(e) = dispatcher.enqueue(job).await {
                warn!("failed to requeue persisted job: {}", e);
            }
        }
    }
    info!("requeued {} persisted job(s)", dispatcher.queued());

    dispatcher.start(&tasks);

    // One autoscaler per configured pool
    let monitor_interval = Duration::from_secs(config.scaling.monitor_interval_seconds);
    let mut autoscalers = Vec::new();
    for pool in &config.scaling.pools {
        let siblings: Vec<String> = config
            .scaling
            .pools
            .iter()
            .filter(|p| p.repo != pool.repo)
            .map(|p| p.repo.clone())
            .collect();

        let scaler = Arc::new(Autoscaler::new(
            pool.clone(),
            siblings,
            fleet.clone(),
            events.clone(),
            db.clone(),
        ));
        scaler.start(&tasks, monitor_interval);
        autoscalers.push(scaler);
    }
    info!("started {} autoscaler(s), interval {:?}", autoscalers.len(), monitor_interval);

    // Cleanup sweep: health, deregistration retries, stuck and orphaned
    // containers
    {
        let fleet = fleet.clone();
        tasks.spawn_periodic(
            "cleanup",
            Duration::from_secs(config.scaling.cleanup_interval_seconds),
            false,
            move || {
                let fleet = fleet.clone();
                async move {
                    fleet.cleanup_sweep().await;
                }
            },
        );
    }

    info!("fleet daemon running");
    tokio::signal::ctrl_c().await?;
    warn!("received shutdown signal");

    // Stop scheduling new work, drain the dispatcher and the loops, then
    // take the fleet down within the bounded grace period
    tasks.shutdown(Duration::from_secs(10)).await;
    fleet
        .shutdown(Duration::from_secs(config.scaling.shutdown_grace_seconds))
        .await;

    debug!("daemon stopped");
    Ok(())
}
