//! Per-key mutual exclusion.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;

/// Hands out one mutex per key.
///
/// Workers migrating the same `(instance, database)` pair serialize on its
/// lock while other pairs proceed in parallel.
pub struct KeyedLocks<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// The lock for `key`, created on first use.
    pub fn handle(&self, key: &K) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(key) {
            return lock.clone();
        }
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop locks nobody holds a handle to.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_shares_lock() {
        let locks = KeyedLocks::new();
        let a = locks.handle(&(1i64, 2i64));
        let b = locks.handle(&(1i64, 2i64));
        assert!(Arc::ptr_eq(&a, &b));

        let _guard = a.lock();
        assert!(b.try_lock().is_none());
        assert!(locks.handle(&(1, 3)).try_lock().is_some());
    }

    #[test]
    fn test_prune_keeps_held_locks() {
        let locks = KeyedLocks::new();
        let held = locks.handle(&1u32);
        drop(locks.handle(&2u32));
        locks.prune();
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.prune();
        assert!(locks.is_empty());
    }
}
