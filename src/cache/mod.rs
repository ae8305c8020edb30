//! Bounded resource caches
//!
//! Vocabularies, inverted indexes, neighbor indexes and normalizers are held
//! in a [`ResourceCache`] keyed by their content key. Each cache keeps at most
//! `capacity` entries and evicts the least recently used one when full. The
//! owning service closes its caches on shutdown; a closed cache holds nothing
//! and refuses inserts.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;

use crate::{Error, Result};

struct CacheEntry<V> {
    value: Arc<V>,
    last_access: u64,
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    tick: u64,
    closed: bool,
    stats: CacheStats,
}

impl<V> CacheState<V> {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

/// Runtime statistics for a cache. Intended for testing and introspection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entry_count: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct ResourceCache<V> {
    name: &'static str,
    capacity: usize,
    state: Mutex<CacheState<V>>,
}

impl<V> ResourceCache<V> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                tick: 0,
                closed: false,
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        let mut guard = self.state.lock();
        if guard.closed {
            return None;
        }
        let tick = guard.touch();
        let state = &mut *guard;
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = tick;
                state.stats.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    /// Insert or overwrite an entry, evicting the least recently used one if full.
    pub fn insert(&self, key: impl Into<String>, value: Arc<V>) -> Result<()> {
        let mut guard = self.state.lock();
        if guard.closed {
            return Err(Error::internal(format!("{} cache is closed", self.name)));
        }
        self.attach_entry(&mut guard, key.into(), value);
        Ok(())
    }

    /// Return the cached value for `key`, building it with `build` on a miss.
    ///
    /// The lock is not held while building. If another caller inserted the
    /// same key in the meantime, its value wins and is returned.
    pub fn get_or_try_insert_with<F>(&self, key: &str, build: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let built = Arc::new(build()?);

        let mut guard = self.state.lock();
        if guard.closed {
            return Err(Error::internal(format!("{} cache is closed", self.name)));
        }
        let tick = guard.touch();
        if let Some(entry) = guard.entries.get_mut(key) {
            entry.last_access = tick;
            return Ok(entry.value.clone());
        }
        self.attach_entry(&mut guard, key.to_string(), built.clone());
        Ok(built)
    }

    pub fn remove(&self, key: &str) -> Option<Arc<V>> {
        let mut guard = self.state.lock();
        let removed = guard.entries.remove(key).map(|entry| entry.value);
        guard.stats.entry_count = guard.entries.len();
        removed
    }

    /// Keys currently resident, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let guard = self.state.lock();
        CacheStats {
            entry_count: guard.entries.len(),
            ..guard.stats
        }
    }

    /// Drop every entry and refuse further inserts.
    pub fn close(&self) {
        let mut guard = self.state.lock();
        let dropped = guard.entries.len();
        guard.entries.clear();
        guard.closed = true;
        guard.stats.entry_count = 0;
        tracing::debug!(cache = self.name, dropped, "Closed resource cache");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn attach_entry(&self, guard: &mut MutexGuard<'_, CacheState<V>>, key: String, value: Arc<V>) {
        let tick = guard.touch();
        let replaced = guard
            .entries
            .insert(
                key,
                CacheEntry {
                    value,
                    last_access: tick,
                },
            )
            .is_some();
        if !replaced {
            self.evict_if_needed(guard);
        }
        guard.stats.entry_count = guard.entries.len();
    }

    fn evict_if_needed(&self, guard: &mut CacheState<V>) {
        while guard.entries.len() > self.capacity {
            match self.select_victim(guard) {
                Some(key) => {
                    guard.entries.remove(&key);
                    guard.stats.evictions += 1;
                    tracing::debug!(cache = self.name, key = %key, "Evicted cache entry");
                }
                None => break,
            }
        }
    }

    fn select_victim(&self, guard: &CacheState<V>) -> Option<String> {
        guard
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(key, _)| key.clone())
    }
}
