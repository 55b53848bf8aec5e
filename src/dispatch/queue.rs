//! Priority queue of delegated jobs

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::Mutex;

use crate::types::DelegatedJob;

/// Heap entry ordering: higher priority first, then oldest enqueue time,
/// then id for determinism.
struct QueuedJob(DelegatedJob);

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.queued_at.cmp(&self.0.queued_at))
            .then_with(|| other.0.id.cmp(&self.0.id))
    }
}

/// Thread-safe priority queue
pub struct JobQueue {
    heap: Mutex<BinaryHeap<QueuedJob>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    pub fn push(&self, job: DelegatedJob) {
        self.heap.lock().push(QueuedJob(job));
    }

    pub fn pop(&self) -> Option<DelegatedJob> {
        self.heap.lock().pop().map(|q| q.0)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(id: &str, priority: u8) -> DelegatedJob {
        DelegatedJob::new(
            id.to_string(),
            "acme/widgets".into(),
            "build".into(),
            vec![],
        )
        .with_priority(priority)
    }

    #[test]
    fn test_fifo_within_same_priority() {
        let queue = JobQueue::new();

        let mut first = job("a", 0);
        first.queued_at = first.queued_at - Duration::seconds(10);
        let second = job("b", 0);

        queue.push(second);
        queue.push(first);

        assert_eq!(queue.pop().unwrap().id, "a");
        assert_eq!(queue.pop().unwrap().id, "b");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_priority_wins_over_age() {
        let queue = JobQueue::new();

        let mut old_low = job("low", 0);
        old_low.queued_at = old_low.queued_at - Duration::seconds(60);
        let fresh_high = job("high", 5);

        queue.push(old_low);
        queue.push(fresh_high);

        assert_eq!(queue.pop().unwrap().id, "high");
        assert_eq!(queue.pop().unwrap().id, "low");
    }

    #[test]
    fn test_len() {
        let queue = JobQueue::new();
        assert!(queue.is_empty());

        queue.push(job("a", 0));
        queue.push(job("b", 0));
        assert_eq!(queue.len(), 2);
    }
}
