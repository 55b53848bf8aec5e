//! Supervised background tasks
//!
//! Periodic work (autoscaler ticks, resource sampling, cleanup sweeps) runs
//! inside a task group holding a shared cancellation token, so shutdown is a
//! single cancel followed by a bounded wait instead of orphaned timers.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A group of background tasks sharing one cancellation token
pub struct TaskGroup {
    token: CancellationToken,
    handles: parking_lot::Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            handles: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// The group's cancellation token, for tasks that need to observe it
    /// inside their own select loops
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn a periodic task. The closure runs every `interval`; the first
    /// run happens after one interval unless `run_immediately` is set.
    pub fn spawn_periodic<F, Fut>(
        &self,
        name: impl Into<String>,
        interval: Duration,
        run_immediately: bool,
        task: F,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = self.token.clone();

        let handle = tokio::spawn({
            let name = name.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                if !run_immediately {
                    // interval fires immediately on first tick
                    ticker.tick().await;
                }

                loop {
                    tokio::select! {
                        _ = token.cancelled() => {
                            debug!("periodic task {} stopping", name);
                            return;
                        }
                        _ = ticker.tick() => {
                            task().await;
                        }
                    }
                }
            }
        });

        self.handles.lock().push((name, handle));
    }

    /// Spawn a one-shot task tracked by the group
    pub fn spawn<Fut>(&self, name: impl Into<String>, fut: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let handle = tokio::spawn(fut);
        self.handles.lock().push((name, handle));
    }

    /// Cancel all tasks and wait for them to finish, up to `grace`.
    /// Tasks still running afterwards are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        self.token.cancel();

        let handles: Vec<(String, JoinHandle<()>)> = self.handles.lock().drain(..).collect();
        let deadline = tokio::time::Instant::now() + grace;

        for (name, handle) in handles {
            let abort = handle.abort_handle();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!("task {} panicked during shutdown: {}", name, e),
                Err(_) => {
                    warn!("task {} did not stop within grace period, aborting", name);
                    abort.abort();
                }
            }
        }
    }

    /// Number of tasks ever registered and not yet drained by shutdown
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_runs() {
        let group = TaskGroup::new();
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = counter.clone();
        group.spawn_periodic("tick", Duration::from_secs(1), false, move || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        group.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_tasks() {
        let group = TaskGroup::new();
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = counter.clone();
        group.spawn_periodic("tick", Duration::from_secs(1), false, move || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        group.shutdown(Duration::from_secs(1)).await;
        let after = counter.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after);
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_run_immediately() {
        let group = TaskGroup::new();
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = counter.clone();
        group.spawn_periodic("tick", Duration::from_secs(3600), true, move || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        group.shutdown(Duration::from_secs(1)).await;
    }
}
