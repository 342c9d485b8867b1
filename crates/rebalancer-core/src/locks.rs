use crate::error::RebalancerError;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

/// Single-writer serialization keyed by identity.
///
/// Different keys never contend. A nested `with_lock` for a key the current
/// thread already holds fails with [`RebalancerError::ReentrantCall`] instead
/// of deadlocking; other threads block until the holder finishes.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
    holders: DashMap<String, ThreadId>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            holders: DashMap::new(),
        }
    }

    pub fn with_lock<T>(
        &self,
        key: &str,
        f: impl FnOnce() -> Result<T, RebalancerError>,
    ) -> Result<T, RebalancerError> {
        let current = std::thread::current().id();
        if self.is_held_by(key, current) {
            return Err(RebalancerError::ReentrantCall(key.to_string()));
        }

        let lock = self.locks.entry(key.to_string()).or_default().clone();
        let result = {
            // `()` carries no invariant, so a poisoned lock is still usable.
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

            self.holders.insert(key.to_string(), current);
            let _holder = HolderToken {
                holders: &self.holders,
                key,
            };
            f()
        };

        // Drop the entry once no other caller holds or waits on it.
        drop(lock);
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Number of keys with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn is_held_by(&self, key: &str, thread: ThreadId) -> bool {
        self.holders
            .get(key)
            .map(|holder| *holder == thread)
            .unwrap_or(false)
    }
}

struct HolderToken<'a> {
    holders: &'a DashMap<String, ThreadId>,
    key: &'a str,
}

impl Drop for HolderToken<'_> {
    fn drop(&mut self) {
        self.holders.remove(self.key);
    }
}
