//! In-memory runner registry
//!
//! Authoritative index of runners owned by this manager, keyed by name with
//! reverse indices by provider id and container id. A single mutex guards
//! O(1) map operations only; nothing here performs I/O. Every mutation
//! emits a change record consumed by the best-effort persistence task, so
//! durable mirroring never blocks a state transition.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::types::{Runner, RunnerStatus};

/// A mutation streamed to the persistence task
#[derive(Debug, Clone)]
pub enum RegistryChange {
    Upserted(Runner),
    Removed { name: String },
}

#[derive(Default)]
struct Inner {
    by_name: HashMap<String, Runner>,
    by_provider_id: HashMap<i64, String>,
    by_container_id: HashMap<String, String>,
}

/// Runner index with change streaming
pub struct Registry {
    inner: Mutex<Inner>,
    changes: mpsc::UnboundedSender<RegistryChange>,
}

impl Registry {
    /// Create a registry plus the receiving end of its change stream
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RegistryChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Mutex::new(Inner::default()),
                changes: tx,
            },
            rx,
        )
    }

    fn emit(&self, change: RegistryChange) {
        // Persistence is best-effort; a dropped receiver must not stall us
        let _ = self.changes.send(change);
    }

    /// Insert a new runner; names must be unique
    pub fn insert(&self, runner: Runner) -> Result<()> {
        let mut inner = self.inner.lock();

        if inner.by_name.contains_key(&runner.name) {
            return Err(Error::Conflict(format!(
                "runner {} already registered",
                runner.name
            )));
        }

        if let Some(id) = runner.provider_id {
            inner.by_provider_id.insert(id, runner.name.clone());
        }
        if let Some(id) = &runner.container_id {
            inner.by_container_id.insert(id.clone(), runner.name.clone());
        }
        inner.by_name.insert(runner.name.clone(), runner.clone());
        drop(inner);

        self.emit(RegistryChange::Upserted(runner));
        Ok(())
    }

    /// Remove a runner and its reverse index entries
    pub fn remove(&self, name: &str) -> Option<Runner> {
        let mut inner = self.inner.lock();
        let runner = inner.by_name.remove(name)?;

        if let Some(id) = runner.provider_id {
            inner.by_provider_id.remove(&id);
        }
        if let Some(id) = &runner.container_id {
            inner.by_container_id.remove(id);
        }
        drop(inner);

        self.emit(RegistryChange::Removed {
            name: name.to_string(),
        });
        Some(runner)
    }

    pub fn get(&self, name: &str) -> Option<Runner> {
        self.inner.lock().by_name.get(name).cloned()
    }

    pub fn by_provider_id(&self, provider_id: i64) -> Option<Runner> {
        let inner = self.inner.lock();
        let name = inner.by_provider_id.get(&provider_id)?;
        inner.by_name.get(name).cloned()
    }

    pub fn by_container_id(&self, container_id: &str) -> Option<Runner> {
        let inner = self.inner.lock();
        let name = inner.by_container_id.get(container_id)?;
        inner.by_name.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().by_name.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consistent point-in-time copy of all runners
    pub fn snapshot(&self) -> Vec<Runner> {
        self.inner.lock().by_name.values().cloned().collect()
    }

    /// Update a runner's status; returns the previous status
    pub fn set_status(&self, name: &str, status: RunnerStatus) -> Result<RunnerStatus> {
        let updated = {
            let mut inner = self.inner.lock();
            let runner = inner
                .by_name
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("runner {}", name)))?;

            let previous = runner.status;
            if status == RunnerStatus::Idle && previous != RunnerStatus::Idle {
                runner.idle_since = Some(Utc::now());
            } else if status != RunnerStatus::Idle {
                runner.idle_since = None;
            }
            runner.status = status;
            (previous, runner.clone())
        };

        self.emit(RegistryChange::Upserted(updated.1));
        Ok(updated.0)
    }

    /// Record the provider id once the provider lists the runner
    pub fn bind_provider(&self, name: &str, provider_id: i64) -> Result<()> {
        let updated = {
            let mut inner = self.inner.lock();
            let runner = inner
                .by_name
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("runner {}", name)))?;
            runner.provider_id = Some(provider_id);
            let snapshot = runner.clone();
            inner.by_provider_id.insert(provider_id, name.to_string());
            snapshot
        };

        self.emit(RegistryChange::Upserted(updated));
        Ok(())
    }

    /// Drop the provider binding after successful deregistration
    pub fn clear_provider(&self, name: &str) -> Result<()> {
        let updated = {
            let mut inner = self.inner.lock();
            let runner = inner
                .by_name
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("runner {}", name)))?;
            let old = runner.provider_id.take();
            let snapshot = runner.clone();
            if let Some(id) = old {
                inner.by_provider_id.remove(&id);
            }
            snapshot
        };

        self.emit(RegistryChange::Upserted(updated));
        Ok(())
    }

    /// Record the backing container id
    pub fn bind_container(&self, name: &str, container_id: &str) -> Result<()> {
        let updated = {
            let mut inner = self.inner.lock();
            let runner = inner
                .by_name
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("runner {}", name)))?;
            runner.container_id = Some(container_id.to_string());
            let snapshot = runner.clone();
            inner
                .by_container_id
                .insert(container_id.to_string(), name.to_string());
            snapshot
        };

        self.emit(RegistryChange::Upserted(updated));
        Ok(())
    }

    /// Refresh the provider-heartbeat timestamp
    pub fn heartbeat(&self, name: &str) -> Result<()> {
        let updated = {
            let mut inner = self.inner.lock();
            let runner = inner
                .by_name
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("runner {}", name)))?;
            runner.last_heartbeat = Utc::now();
            runner.clone()
        };

        self.emit(RegistryChange::Upserted(updated));
        Ok(())
    }

    /// Backdate a runner's idle-since marker (test setup only)
    #[cfg(test)]
    pub fn set_idle_since(&self, name: &str, since: chrono::DateTime<Utc>) {
        if let Some(runner) = self.inner.lock().by_name.get_mut(name) {
            runner.idle_since = Some(since);
        }
    }

    /// Backdate a runner's last provider heartbeat (test setup only)
    #[cfg(test)]
    pub fn set_last_heartbeat(&self, name: &str, at: chrono::DateTime<Utc>) {
        if let Some(runner) = self.inner.lock().by_name.get_mut(name) {
            runner.last_heartbeat = at;
        }
    }

    /// Atomically flip an Idle runner to Busy for a job assignment.
    /// Fails with `PreconditionFailed` if the runner is not Idle, so two
    /// dispatch passes can never double-book a runner.
    pub fn try_assign(&self, name: &str) -> Result<()> {
        let updated = {
            let mut inner = self.inner.lock();
            let runner = inner
                .by_name
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("runner {}", name)))?;

            if runner.status != RunnerStatus::Idle {
                return Err(Error::PreconditionFailed(format!(
                    "runner {} is {}, not idle",
                    name, runner.status
                )));
            }
            runner.status = RunnerStatus::Busy;
            runner.idle_since = None;
            runner.clone()
        };

        self.emit(RegistryChange::Upserted(updated));
        Ok(())
    }
}
