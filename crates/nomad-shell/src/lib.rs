pub mod app;
pub mod config;
pub mod events;
pub mod handoff;
pub mod launch;
pub mod lines;
pub mod probe;
pub mod readiness;
pub mod retry;
pub mod supervisor;
pub mod surface;
pub mod users;

use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
