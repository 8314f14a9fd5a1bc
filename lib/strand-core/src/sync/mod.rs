//! Synchronization primitives for fibers.
use std::sync::{Mutex, MutexGuard, PoisonError};

mod deferred;
pub use self::deferred::{Deferred, DeferredError};

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// Every critical section in the runtime only moves plain values in and out, so a poisoned lock never guards a
/// half-updated state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
