//! Per-user mutual exclusion for the ledger read-then-write.

use std::sync::{Arc, Mutex, PoisonError};

use rustc_hash::FxHashMap;

/// Map from user id to a lock, created on demand and dropped when unused.
#[derive(Debug, Default)]
pub struct UserLocks {
    locks: Mutex<FxHashMap<String, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding `user_id`'s lock. Other users are not blocked.
    pub fn with_lock<R>(&self, user_id: &str, f: impl FnOnce() -> R) -> R {
        let entry = {
            let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(user_id.to_string()).or_default())
        };
        let release = Release {
            locks: self,
            user_id,
            entry,
        };

        let _held = release.entry.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Number of users with a live lock entry.
    #[cfg(test)]
    fn active(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Drops the map entry once its last user is done, also when `f` unwinds.
struct Release<'a> {
    locks: &'a UserLocks,
    user_id: &'a str,
    entry: Arc<Mutex<()>>,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        let mut map = self.locks.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // map + this call are the only holders
        if Arc::strong_count(&self.entry) == 2 {
            map.remove(self.user_id);
        }
    }
}
