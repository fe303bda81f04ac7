//! Condition-variable primitives shared across threads

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lock a mutex, recovering the guard if a panicking holder poisoned it.
///
/// Task bodies and consumer callbacks are run under `catch_unwind`, so a
/// poisoned lock only means a panic was already reported elsewhere.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A boolean flag paired with a condition variable.
///
/// Setting happens under the lock and wakes every waiter; waiters re-check
/// the flag after each wakeup.
#[derive(Debug, Default)]
pub struct Signal {
    state: Mutex<bool>,
    changed: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut state = lock(&self.state);
        *state = true;
        self.changed.notify_all();
    }

    pub fn reset(&self) {
        *lock(&self.state) = false;
    }

    pub fn is_set(&self) -> bool {
        *lock(&self.state)
    }

    /// Block until the flag is set or `timeout` elapses. Returns the flag.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = lock(&self.state);
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |set| !*set)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}
