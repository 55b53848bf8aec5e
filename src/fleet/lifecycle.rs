//! Runner lifecycle transitions
//!
//! The create / stop / remove flows. Each transition is serialized by the
//! runner's lock in the manager; ordering rules live here:
//! registration-then-start inside create, deregistration-after-stop inside
//! stop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::docker::ContainerSpec;
use crate::error::{Error, Result};
use crate::types::{ContainerRecord, DesiredState, ObservedState, Runner, RunnerStatus};

use super::manager::FleetManager;

/// Environment variable names the runner image contract requires
const ENV_RUNNER_NAME: &str = "RUNNER_NAME";
const ENV_RUNNER_TOKEN: &str = "RUNNER_TOKEN";
const ENV_RUNNER_LABELS: &str = "RUNNER_LABELS";
const ENV_RUNNER_EPHEMERAL: &str = "RUNNER_EPHEMERAL";
const ENV_RUNNER_REPOSITORY: &str = "RUNNER_REPOSITORY";

/// Create a runner: mint a token, create and start the container, insert
/// the registry entry as Starting.
///
/// Idempotent by name: if the runner already exists the call is a no-op.
/// If any step fails after the token is minted, the token is dropped
/// without ever being persisted and the partial container is removed
/// best-effort.
pub(super) async fn spawn(
    mgr: &Arc<FleetManager>,
    name: String,
    repository: Option<&str>,
) -> Result<Runner> {
    if let Some(existing) = mgr.registry().get(&name) {
        debug!("spawn of {} is a no-op, already registered", name);
        return Ok(existing);
    }

    let provider_repo = mgr.config().provider.repo.clone();
    let runner_config = &mgr.config().docker.runner;
    let labels = runner_config.labels.clone();

    let token = mgr
        .provider()
        .mint_registration_token(&provider_repo)
        .await?;

    let mut env: HashMap<String, String> = runner_config.env.clone();
    env.insert(ENV_RUNNER_NAME.into(), name.clone());
    env.insert(ENV_RUNNER_TOKEN.into(), token.secret().to_string());
    env.insert(ENV_RUNNER_LABELS.into(), labels.join(","));
    env.insert(
        ENV_RUNNER_EPHEMERAL.into(),
        runner_config.ephemeral.to_string(),
    );
    if let Some(repo) = repository {
        env.insert(ENV_RUNNER_REPOSITORY.into(), repo.to_string());
    }

    let spec = ContainerSpec {
        name: name.clone(),
        image: runner_config.image.clone(),
        env,
        labels: labels.clone(),
        repository: repository.map(str::to_string),
        ephemeral: runner_config.ephemeral,
        cpu_limit: runner_config.cpu_limit,
        memory_limit: runner_config.memory_limit_mb.map(|mb| mb * 1024 * 1024),
        network: mgr.config().docker.network.clone(),
        mounts: runner_config
            .mounts
            .iter()
            .map(|m| crate::docker::MountSpec {
                source: m.source.clone(),
                target: m.target.clone(),
                read_only: m.read_only,
            })
            .collect(),
    };

    let container_id = mgr.driver().create(&spec).await?;

    if let Err(e) = mgr.driver().start(&container_id).await {
        warn!("start of container for {} failed, rolling back: {}", name, e);
        if let Err(remove_err) = mgr.driver().remove(&container_id, true).await {
            warn!(
                "rollback removal of container {} failed: {}",
                container_id, remove_err
            );
        }
        return Err(e.into());
    }

    let mut record = ContainerRecord::new(
        container_id.clone(),
        name.clone(),
        repository.map(str::to_string),
        spec.image.clone(),
        labels.clone(),
    );
    record.set_desired(DesiredState::Running);
    record.set_observed(ObservedState::Running);
    mgr.insert_container(record);

    let mut runner = Runner::new(name.clone(), repository.map(str::to_string), labels);
    runner.container_id = Some(container_id.clone());
    mgr.registry().insert(runner.clone())?;

    mgr.events()
        .publish_runner_state(&name, RunnerStatus::Starting);
    mgr.start_sampler(&container_id);

    info!("spawned runner {} in container {}", name, container_id);
    Ok(runner)
}

/// Stop a runner: graceful container stop (force-kill on timeout), then
/// deregister from the provider.
///
/// Deregistration strictly follows the stop so the provider cannot hand the
/// runner a job mid-shutdown. If deregistration fails the runner stays
/// Offline with its provider id and the cleanup sweep retries it.
pub(super) async fn stop(
    mgr: &FleetManager,
    name: &str,
    graceful: Option<Duration>,
) -> Result<()> {
    let runner = mgr
        .registry()
        .get(name)
        .ok_or_else(|| Error::NotFound(format!("runner {}", name)))?;

    if runner.status == RunnerStatus::Offline {
        // Already stopped; deregistration may still be pending
        return deregister(mgr, name).await;
    }

    mgr.registry().set_status(name, RunnerStatus::Stopping)?;
    mgr.events()
        .publish_runner_state(name, RunnerStatus::Stopping);

    let graceful =
        graceful.unwrap_or_else(|| Duration::from_secs(mgr.config().docker.stop_grace_seconds));

    if let Some(container_id) = &runner.container_id {
        mgr.stop_sampler(container_id);

        match mgr.driver().stop(container_id, graceful).await {
            Ok(()) => {}
            Err(e) if !e.is_retryable() => {
                debug!("container {} already gone: {}", container_id, e);
            }
            Err(e) => {
                // Leave the runner in Stopping; the cleanup sweep retries
                return Err(e.into());
            }
        }

        let observed = mgr
            .driver()
            .inspect(container_id)
            .await
            .unwrap_or(ObservedState::Missing);
        mgr.update_container(container_id, |record| {
            record.set_desired(DesiredState::Stopped);
            record.set_observed(observed);
        });
    }

    deregister(mgr, name).await
}

/// Delete the provider-side record and settle the runner at Offline
async fn deregister(mgr: &FleetManager, name: &str) -> Result<()> {
    let runner = mgr
        .registry()
        .get(name)
        .ok_or_else(|| Error::NotFound(format!("runner {}", name)))?;

    if let Some(provider_id) = runner.provider_id {
        let repo = mgr.config().provider.repo.clone();
        match mgr.provider().delete_runner(&repo, provider_id).await {
            Ok(()) => {
                mgr.registry().clear_provider(name)?;
            }
            Err(e) => {
                warn!(
                    "deregistration of {} failed, will retry on next sweep: {}",
                    name, e
                );
                mgr.registry().set_status(name, RunnerStatus::Offline)?;
                mgr.events()
                    .publish_runner_state(name, RunnerStatus::Offline);
                return Ok(());
            }
        }
    }

    mgr.registry().set_status(name, RunnerStatus::Offline)?;
    mgr.events()
        .publish_runner_state(name, RunnerStatus::Offline);
    info!("stopped runner {}", name);
    Ok(())
}

/// Remove a runner's container and delete the runner entry.
///
/// Requires the container to be stopped unless `force` is set. Idempotent:
/// removing an unknown runner succeeds.
pub(super) async fn remove(mgr: &FleetManager, name: &str, force: bool) -> Result<()> {
    let runner = match mgr.registry().get(name) {
        Some(runner) => runner,
        None => {
            debug!("remove of {} is a no-op, not registered", name);
            return Ok(());
        }
    };

    if let Some(container_id) = &runner.container_id {
        let observed = mgr
            .driver()
            .inspect(container_id)
            .await
            .unwrap_or(ObservedState::Missing);

        if !force && !observed.is_stopped() {
            return Err(Error::PreconditionFailed(format!(
                "container for {} is {:?}, stop it first",
                name, observed
            )));
        }

        mgr.stop_sampler(container_id);
        mgr.driver().remove(container_id, force).await?;
        mgr.update_container(container_id, |record| {
            record.set_desired(DesiredState::Removed);
            record.set_observed(ObservedState::Missing);
        });
        mgr.drop_container(container_id);
    }

    mgr.registry().remove(name);
    info!("removed runner {}", name);
    Ok(())
}
