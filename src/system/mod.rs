//! System utilities module
//!
//! Operation locking and supervised periodic tasks used by the lifecycle
//! manager, the autoscaler and the dispatcher.

mod locker;
mod tasks;

pub use locker::{Locker, LockerError, LockerGuard, OwnedLockerGuard};
pub use tasks::TaskGroup;
