#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex, MutexGuard};

/// Serializes pipeline invocations that touch the same identifier.
///
/// Different keys never block each other. The guard releases its key on drop.
#[derive(Debug, Default)]
pub struct IdLocks {
    held: Mutex<BTreeSet<String>>,
    released: Condvar,
}

#[derive(Debug)]
pub struct IdLockGuard<'a> {
    locks: &'a IdLocks,
    key: String,
}

impl IdLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, key: impl Into<String>) -> IdLockGuard<'_> {
        let key = key.into();
        let mut held = self.held_set();
        while held.contains(&key) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        held.insert(key.clone());
        IdLockGuard { locks: self, key }
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held_set().contains(key)
    }

    fn held_set(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for IdLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.held_set().remove(&self.key);
        self.locks.released.notify_all();
    }
}
