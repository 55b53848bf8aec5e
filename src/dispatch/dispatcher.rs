//! Single-writer job assignment loop

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::error::{Error, Result};
use crate::events::{DemandHint, Event, EventBus};
use crate::registry::Registry;
use crate::system::TaskGroup;
use crate::types::{DelegatedJob, JobStatus, Runner, RunnerStatus};

use super::queue::JobQueue;

/// How well a runner's repository binding matches a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum BindingRank {
    Unbound,
    Glob,
    Exact,
}

/// Drains the job queue onto idle runners
pub struct Dispatcher {
    queue: JobQueue,
    registry: Arc<Registry>,
    db: Arc<Database>,
    events: EventBus,
    assignment_timeout: Duration,

    /// Jobs that left the queue but have not reached a terminal state,
    /// keyed by job id
    in_flight: DashMap<String, DelegatedJob>,

    /// Jobs cancelled while still queued; skipped when popped
    tombstones: Mutex<HashSet<String>>,

    /// Wakes the assignment loop
    notify: Notify,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        db: Arc<Database>,
        events: EventBus,
        assignment_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: JobQueue::new(),
            registry,
            db,
            events,
            assignment_timeout,
            in_flight: DashMap::new(),
            tombstones: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        })
    }

    /// Number of jobs waiting for a runner
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    // ========================================================================
    // Intake and provider signals (the webhook surface calls these)
    // ========================================================================

    /// Accept a job into the queue
    pub async fn enqueue(&self, mut job: DelegatedJob) -> Result<()> {
        if job.id.is_empty() {
            return Err(Error::Invalid("job id must not be empty".into()));
        }

        job.status = JobStatus::Queued;
        job.assigned_runner = None;
        if let Err(e) = self.db.upsert_job(&job).await {
            warn!("failed to persist job {}: {}", job.id, e);
        }
        self.events.publish_job(&job.id, JobStatus::Queued);

        debug!("queued job {} for {}", job.id, job.repository);
        self.queue.push(job);
        self.notify.notify_one();
        Ok(())
    }

    /// A runner heartbeat reported the job as executing
    pub async fn mark_running(&self, job_id: &str) -> Result<()> {
        let mut job = self
            .in_flight
            .get_mut(job_id)
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;

        if job.status != JobStatus::Assigned {
            return Err(Error::PreconditionFailed(format!(
                "job {} is {}, not assigned",
                job_id, job.status
            )));
        }

        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        let snapshot = job.clone();
        drop(job);

        if let Err(e) = self.db.upsert_job(&snapshot).await {
            warn!("failed to persist job {}: {}", job_id, e);
        }
        self.events.publish_job(job_id, JobStatus::Running);
        Ok(())
    }

    /// Provider signalled a terminal state for the job
    pub async fn complete(&self, job_id: &str, status: JobStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(Error::Invalid(format!(
                "{} is not a terminal job status",
                status
            )));
        }

        let Some((_, mut job)) = self.in_flight.remove(job_id) else {
            // Still queued (or unknown): tombstone so the loop drops it
            self.tombstones.lock().insert(job_id.to_string());
            self.events.publish_job(job_id, status);
            return Ok(());
        };

        job.status = status;
        job.completed_at = Some(Utc::now());
        if let Err(e) = self.db.upsert_job(&job).await {
            warn!("failed to persist job {}: {}", job_id, e);
        }
        self.events.publish_job(job_id, status);

        info!("job {} finished as {}", job_id, status);
        Ok(())
    }

    // ========================================================================
    // Assignment
    // ========================================================================

    /// Rank a runner's repository binding against a job's repository
    fn binding_rank(runner: &Runner, repository: &str) -> Option<BindingRank> {
        match &runner.repository {
            None => Some(BindingRank::Unbound),
            Some(bound) if bound == repository => Some(BindingRank::Exact),
            Some(bound) => glob::Pattern::new(bound)
                .ok()
                .filter(|p| p.matches(repository))
                .map(|_| BindingRank::Glob),
        }
    }

    /// Pick the best idle runner for a job: labels must cover the job's,
    /// binding rank decides (exact > glob > unbound), oldest idle wins ties.
    fn select_runner(&self, job: &DelegatedJob) -> Option<String> {
        let mut candidates: Vec<(BindingRank, Runner)> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|r| r.status == RunnerStatus::Idle)
            .filter(|r| job.labels.iter().all(|l| r.labels.contains(l)))
            .filter_map(|r| Self::binding_rank(&r, &job.repository).map(|rank| (rank, r)))
            .collect();

        candidates.sort_by(|(rank_a, a), (rank_b, b)| {
            rank_b
                .cmp(rank_a)
                .then_with(|| a.idle_since.cmp(&b.idle_since))
        });

        candidates.into_iter().next().map(|(_, r)| r.name)
    }

    /// One assignment pass. Pops every queued job once; jobs with no
    /// matching runner go back to the queue and raise demand hints.
    pub async fn drain_once(&self) {
        let mut unmatched: Vec<DelegatedJob> = Vec::new();
        let mut hinted_repos: HashSet<String> = HashSet::new();

        while let Some(mut job) = self.queue.pop() {
            if self.tombstones.lock().remove(&job.id) {
                debug!("dropping cancelled job {}", job.id);
                continue;
            }

            let Some(runner_name) = self.select_runner(&job) else {
                if hinted_repos.insert(job.repository.clone()) {
                    self.events.publish(Event::Demand(DemandHint {
                        repository: job.repository.clone(),
                        labels: job.labels.clone(),
                    }));
                }
                unmatched.push(job);
                continue;
            };

            // Atomically flip Idle -> Busy; a lost race requeues the job
            match self.registry.try_assign(&runner_name) {
                Ok(()) => {
                    job.status = JobStatus::Assigned;
                    job.assigned_runner = Some(runner_name.clone());
                    job.assigned_at = Some(Utc::now());

                    info!("assigned job {} to runner {}", job.id, runner_name);
                    if let Err(e) = self.db.upsert_job(&job).await {
                        warn!("failed to persist job {}: {}", job.id, e);
                    }
                    self.events.publish_job(&job.id, JobStatus::Assigned);
                    self.events
                        .publish_runner_state(&runner_name, RunnerStatus::Busy);
                    self.in_flight.insert(job.id.clone(), job);
                }
                Err(_) => {
                    debug!(
                        "runner {} was taken before job {} could claim it",
                        runner_name, job.id
                    );
                    unmatched.push(job);
                }
            }
        }

        for job in unmatched {
            self.queue.push(job);
        }
    }

    /// Requeue jobs stuck in Assigned past the timeout and fail their
    /// runner, which evidently never picked the job up.
    pub async fn sweep_assignments(&self) {
        let now = Utc::now();
        let stuck: Vec<String> = self
            .in_flight
            .iter()
            .filter(|entry| {
                entry.value().status == JobStatus::Assigned
                    && entry
                        .value()
                        .assigned_at
                        .map(|at| (now - at).num_seconds() >= self.assignment_timeout.as_secs() as i64)
                        .unwrap_or(false)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for job_id in stuck {
            let Some((_, mut job)) = self.in_flight.remove(&job_id) else {
                continue;
            };

            let runner_name = job.assigned_runner.take();
            warn!(
                "job {} never started on {:?} within {:?}, requeueing",
                job_id, runner_name, self.assignment_timeout
            );

            if let Some(name) = runner_name {
                if self.registry.set_status(&name, RunnerStatus::Failed).is_ok() {
                    self.events.publish_runner_state(&name, RunnerStatus::Failed);
                    self.events.publish(Event::RunnerCrashed {
                        name,
                        exit_code: -1,
                    });
                }
            }

            job.status = JobStatus::Queued;
            job.assigned_at = None;
            if let Err(e) = self.db.upsert_job(&job).await {
                warn!("failed to persist job {}: {}", job.id, e);
            }
            self.events.publish_job(&job.id, JobStatus::Queued);
            self.queue.push(job);
        }

        self.notify.notify_one();
    }

    /// Start the assignment loop and the timeout sweep on the task group
    pub fn start(self: &Arc<Self>, tasks: &TaskGroup) {
        // Single-writer loop: woken by enqueues and by runners going idle
        let dispatcher = self.clone();
        let token = tasks.token();
        let mut rx = self.events.subscribe();
        tasks.spawn("dispatcher", async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("dispatcher loop stopping");
                        return;
                    }
                    _ = dispatcher.notify.notified() => {
                        dispatcher.drain_once().await;
                    }
                    event = rx.recv() => match event {
                        Ok(Event::RunnerState { status: RunnerStatus::Idle, .. }) => {
                            dispatcher.drain_once().await;
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            dispatcher.drain_once().await;
                        }
                        Err(_) => return,
                    }
                }
            }
        });

        let dispatcher = self.clone();
        tasks.spawn_periodic(
            "assignment-sweep",
            self.assignment_timeout.min(Duration::from_secs(30)),
            false,
            move || {
                let dispatcher = dispatcher.clone();
                async move {
                    dispatcher.sweep_assignments().await;
                }
            },
        );
    }
}
