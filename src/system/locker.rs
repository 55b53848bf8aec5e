//! Operation locker for serialized transitions
//!
//! Ensures that only one lifecycle transition runs at a time for a runner,
//! and that autoscaler ticks on the same pool never overlap. A failed
//! `try_acquire` is how an overlapping tick detects the one in flight.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, SemaphorePermit, TryAcquireError};

/// Error type for locker operations
#[derive(Debug, Error)]
pub enum LockerError {
    #[error("lock is currently held")]
    Busy,

    #[error("lock acquisition was cancelled")]
    Cancelled,

    #[error("lock acquisition timed out")]
    Timeout,
}

/// A one-permit lock with both borrowed and owned guards.
///
/// Owned guards can be moved into spawned tasks, which the scale-up path
/// needs: the tick holds the pool lock until every spawn it launched has
/// settled.
pub struct Locker {
    semaphore: Arc<Semaphore>,
}

impl Locker {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Acquire the lock, waiting indefinitely if needed
    pub async fn acquire(&self) -> Result<LockerGuard<'_>, LockerError> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| LockerError::Cancelled)?;
        Ok(LockerGuard { _permit: permit })
    }

    /// Try to acquire the lock without waiting
    pub fn try_acquire(&self) -> Result<LockerGuard<'_>, LockerError> {
        match self.semaphore.try_acquire() {
            Ok(permit) => Ok(LockerGuard { _permit: permit }),
            Err(TryAcquireError::NoPermits) => Err(LockerError::Busy),
            Err(TryAcquireError::Closed) => Err(LockerError::Cancelled),
        }
    }

    /// Try to acquire an owned guard that may outlive `self`'s borrow
    pub fn try_acquire_owned(&self) -> Result<OwnedLockerGuard, LockerError> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(OwnedLockerGuard { _permit: permit }),
            Err(TryAcquireError::NoPermits) => Err(LockerError::Busy),
            Err(TryAcquireError::Closed) => Err(LockerError::Cancelled),
        }
    }

    /// Acquire an owned guard, waiting indefinitely if needed
    pub async fn acquire_owned(&self) -> Result<OwnedLockerGuard, LockerError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| LockerError::Cancelled)?;
        Ok(OwnedLockerGuard { _permit: permit })
    }

    /// Acquire with a timeout
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<LockerGuard<'_>, LockerError> {
        match tokio::time::timeout(timeout, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => Ok(LockerGuard { _permit: permit }),
            Ok(Err(_)) => Err(LockerError::Cancelled),
            Err(_) => Err(LockerError::Timeout),
        }
    }

    /// Whether the lock is currently held
    pub fn is_locked(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

impl Default for Locker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that releases the lock when dropped
pub struct LockerGuard<'a> {
    _permit: SemaphorePermit<'a>,
}

/// Owned guard that releases the lock when dropped
pub struct OwnedLockerGuard {
    _permit: OwnedSemaphorePermit,
}
