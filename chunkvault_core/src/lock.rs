//! Per-key mutual exclusion and pin counts.

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Held lock for one key; released on drop.
pub type KeyGuard = ArcMutexGuard<RawMutex, ()>;

/// Prune idle entries once the table grows past this many keys.
const PRUNE_THRESHOLD: usize = 1024;

/// A table of mutexes created on first use for each key.
///
/// Entries no longer held by anyone are dropped lazily when the table grows,
/// so the table stays proportional to the number of keys in flight.
#[derive(Debug)]
pub struct KeyedLocks<K> {
    table: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Block until the lock for `key` is free, then take it.
    pub fn lock(&self, key: &K) -> KeyGuard {
        let slot = {
            let mut table = self.table.lock();
            if table.len() >= PRUNE_THRESHOLD {
                // Only the table holds a reference: nobody waits or holds it.
                table.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            table
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.lock_arc()
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Outstanding pins per key.
///
/// Unlike a lock, a pin never blocks: any number of holders may pin the same
/// key, and the key counts as pinned until the last guard drops.
#[derive(Debug)]
pub struct PinTable<K> {
    counts: Mutex<HashMap<K, usize>>,
}

impl<K: Eq + Hash + Clone> PinTable<K> {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn pin(&self, key: &K) -> PinGuard<'_, K> {
        *self.counts.lock().entry(key.clone()).or_insert(0) += 1;
        PinGuard {
            table: self,
            key: key.clone(),
        }
    }

    pub fn is_pinned(&self, key: &K) -> bool {
        self.counts.lock().contains_key(key)
    }
}

impl<K: Eq + Hash + Clone> Default for PinTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Held pin for one key; released on drop.
#[derive(Debug)]
pub struct PinGuard<'a, K: Eq + Hash + Clone> {
    table: &'a PinTable<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for PinGuard<'_, K> {
    fn drop(&mut self) {
        let mut counts = self.table.counts.lock();
        if let Some(count) = counts.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&self.key);
            }
        }
    }
}
