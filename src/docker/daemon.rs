//! Docker implementation of the container driver

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::models::{
    ContainerStateStatusEnum, HostConfig, Mount, MountTypeEnum, RestartPolicy,
    RestartPolicyNameEnum,
};
use bollard::Docker;
use tracing::{debug, info};

use crate::config::DockerConfiguration;
use crate::types::{ObservedState, ResourceSample};

use super::driver::{
    ContainerDriver, ContainerSpec, DriverError, DriverResult, ExecOptions, ExecOutput,
    OwnedContainer, LABEL_MANAGED, LABEL_REPOSITORY, LABEL_RUNNER,
};
use super::{exec, stats};

/// Driver backed by a local Docker daemon socket
pub struct DockerDriver {
    client: Docker,
    create_timeout: Duration,
}

impl DockerDriver {
    /// Connect to the configured Docker socket
    pub fn new(config: &DockerConfiguration) -> DriverResult<Self> {
        let client = Docker::connect_with_unix(
            &config.socket,
            120,
            bollard::API_DEFAULT_VERSION,
        )?;

        Ok(Self {
            client,
            create_timeout: Duration::from_secs(config.create_timeout_seconds),
        })
    }

    /// Wrap an existing client, mainly for diagnostics
    pub fn with_client(client: Docker, create_timeout: Duration) -> Self {
        Self {
            client,
            create_timeout,
        }
    }

    pub(crate) fn docker(&self) -> &Docker {
        &self.client
    }

    /// Ping the daemon; used by diagnostics
    pub async fn ping(&self) -> DriverResult<()> {
        self.client.ping().await?;
        Ok(())
    }
}

/// Map a bollard error to the typed driver error
pub(crate) fn map_err(e: bollard::errors::Error, id: &str) -> DriverError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => DriverError::NotFound(id.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => DriverError::Conflict(message),
        other => DriverError::Transport(other),
    }
}

fn status_to_observed(status: ContainerStateStatusEnum) -> ObservedState {
    match status {
        ContainerStateStatusEnum::CREATED => ObservedState::Created,
        ContainerStateStatusEnum::RUNNING => ObservedState::Running,
        ContainerStateStatusEnum::PAUSED => ObservedState::Paused,
        ContainerStateStatusEnum::RESTARTING => ObservedState::Restarting,
        ContainerStateStatusEnum::EXITED => ObservedState::Exited,
        ContainerStateStatusEnum::REMOVING | ContainerStateStatusEnum::DEAD => ObservedState::Dead,
        _ => ObservedState::Missing,
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn create(&self, spec: &ContainerSpec) -> DriverResult<String> {
        if spec.image.is_empty() {
            return Err(DriverError::InvalidSpec("image must not be empty".into()));
        }

        let env_vars: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_RUNNER.to_string(), spec.name.clone());
        if let Some(repo) = &spec.repository {
            labels.insert(LABEL_REPOSITORY.to_string(), repo.clone());
        }

        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .map(|m| Mount {
                source: Some(m.source.clone()),
                target: Some(m.target.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        // Ephemeral runners exit after one job and their containers
        // auto-remove; persistent runners restart on failure instead.
        let (restart_policy, auto_remove) = if spec.ephemeral {
            (RestartPolicyNameEnum::NO, true)
        } else {
            (RestartPolicyNameEnum::ON_FAILURE, false)
        };

        let host_config = HostConfig {
            auto_remove: Some(auto_remove),
            restart_policy: Some(RestartPolicy {
                name: Some(restart_policy),
                maximum_retry_count: None,
            }),
            memory: spec.memory_limit.map(|m| m as i64),
            nano_cpus: spec.cpu_limit.map(|c| (c * 1_000_000_000.0) as i64),
            network_mode: Some(spec.network.clone()),
            mounts: if mounts.is_empty() {
                None
            } else {
                Some(mounts)
            },
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        };

        let container_config = Config {
            hostname: Some(spec.name.clone()),
            image: Some(spec.image.clone()),
            env: Some(env_vars),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let response = tokio::time::timeout(
            self.create_timeout,
            self.client.create_container(Some(options), container_config),
        )
        .await
        .map_err(|_| DriverError::Timeout)?
        .map_err(|e| map_err(e, &spec.name))?;

        info!("created container {} for runner {}", response.id, spec.name);
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> DriverResult<()> {
        self.client
            .start_container::<String>(id, None)
            .await
            .map_err(|e| map_err(e, id))?;

        debug!("started container {}", id);
        Ok(())
    }

    async fn stop(&self, id: &str, graceful: Duration) -> DriverResult<()> {
        let options = StopContainerOptions {
            t: graceful.as_secs() as i64,
        };

        // The daemon sends SIGKILL itself once the graceful window expires;
        // bound our wait slightly beyond that.
        let deadline = graceful + Duration::from_secs(5);
        let result = tokio::time::timeout(
            deadline,
            self.client.stop_container(id, Some(options)),
        )
        .await
        .map_err(|_| DriverError::Timeout)?;

        match result {
            Ok(()) => Ok(()),
            // Already gone or already stopped is success for a stop
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 304,
                ..
            }) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(map_err(e, id)),
        }
    }

    async fn remove(&self, id: &str, force: bool) -> DriverResult<()> {
        let options = RemoveContainerOptions {
            force,
            v: false,
            ..Default::default()
        };

        match self.client.remove_container(id, Some(options)).await {
            Ok(()) => {
                debug!("removed container {}", id);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("container {} already gone", id);
                Ok(())
            }
            Err(e) => Err(map_err(e, id)),
        }
    }

    async fn inspect(&self, id: &str) -> DriverResult<ObservedState> {
        match self.client.inspect_container(id, None).await {
            Ok(info) => Ok(info
                .state
                .and_then(|s| s.status)
                .map(status_to_observed)
                .unwrap_or(ObservedState::Missing)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(ObservedState::Missing),
            Err(e) => Err(map_err(e, id)),
        }
    }

    async fn stats(&self, id: &str) -> DriverResult<ResourceSample> {
        stats::sample_container(self, id).await
    }

    async fn exec(
        &self,
        id: &str,
        argv: &[String],
        opts: &ExecOptions,
    ) -> DriverResult<ExecOutput> {
        exec::exec_in_container(self, id, argv, opts).await
    }

    async fn list_owned(&self) -> DriverResult<Vec<OwnedContainer>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", LABEL_MANAGED)],
        );

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let summaries = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(DriverError::Transport)?;

        let mut owned = Vec::new();
        for summary in summaries {
            let id = match summary.id {
                Some(id) => id,
                None => continue,
            };
            let labels = summary.labels.unwrap_or_default();
            let runner_name = match labels.get(LABEL_RUNNER) {
                Some(name) => name.clone(),
                // Managed label without a runner name is not ours to adopt
                None => continue,
            };

            owned.push(OwnedContainer {
                id,
                runner_name,
                repository: labels.get(LABEL_REPOSITORY).cloned(),
                image: summary.image.unwrap_or_default(),
                observed: summary
                    .state
                    .as_deref()
                    .map(ObservedState::from)
                    .unwrap_or(ObservedState::Missing),
            });
        }

        Ok(owned)
    }
}
