//! Bounded in-memory LRU over resolved strings.
//!
//! Entries are ordered by last access in an `IndexMap`: the front is the least
//! recently used and is evicted first. Inserting past capacity evicts exactly
//! one entry. Operations are synchronous and never touch the Local Store.
//!
//! Every removal bumps a generation counter. A caller that reads the store
//! and then caches the result takes a [`Generation`] first and writes with
//! [`MemoryCache::put_if_current`], so a value read before a concurrent
//! delete or clear is never cached after it.
//!
//! Hit and miss counters are lock-free atomics; [`MemoryCache::hit_rate`]
//! reports the ratio since creation or the last [`MemoryCache::reset_stats`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;

/// Default capacity when none is configured.
pub const DEFAULT_CAPACITY: usize = 1000;

type CacheKey = (String, String);

/// A resolved string and the store version it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue {
    pub value: String,
    pub version: i64,
}

/// Removal counter of one language, taken before a store read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

#[derive(Debug, Default)]
struct Slots {
    entries: IndexMap<CacheKey, CachedValue>,
    /// Bumped by removals scoped to one language.
    generations: HashMap<String, u64>,
    /// Bumped by removals spanning every language.
    epoch: u64,
}

impl Slots {
    // Both counters only grow, so an unchanged sum means neither moved.
    fn generation(&self, language: &str) -> Generation {
        Generation(self.epoch + self.generations.get(language).copied().unwrap_or(0))
    }

    fn bump(&mut self, language: &str) {
        *self.generations.entry(language.to_string()).or_default() += 1;
    }

    fn insert(&mut self, cache_key: CacheKey, value: String, version: i64, capacity: usize) -> Option<CacheKey> {
        if let Some(existing) = self.entries.shift_remove(&cache_key) {
            let cached = if version >= existing.version { CachedValue { value, version } } else { existing };
            self.entries.insert(cache_key, cached);
            return None;
        }

        self.entries.insert(cache_key, CachedValue { value, version });
        if self.entries.len() > capacity {
            return self.entries.shift_remove_index(0).map(|(evicted, _)| evicted);
        }
        None
    }
}

/// Least-recently-used cache keyed by `(key, language)`.
#[derive(Debug)]
pub struct MemoryCache {
    slots: Mutex<Slots>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MemoryCache {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Mutex::new(Slots {
                entries: IndexMap::with_capacity(capacity.min(4096)),
                ..Default::default()
            }),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a value and mark it most recently used.
    pub fn get(&self, key: &str, language: &str) -> Option<String> {
        let mut slots = self.lock();
        let cache_key = (key.to_string(), language.to_string());
        match slots.entries.shift_remove(&cache_key) {
            Some(cached) => {
                let value = cached.value.clone();
                slots.entries.insert(cache_key, cached);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Look up a value without touching recency or counters.
    pub fn peek(&self, key: &str, language: &str) -> Option<CachedValue> {
        self.lock().entries.get(&(key.to_string(), language.to_string())).cloned()
    }

    /// Insert or refresh a value.
    ///
    /// A value older than the cached one is ignored, so a late writer can't
    /// roll the cache back. Returns the evicted `(key, language)` if the
    /// insertion overflowed capacity.
    pub fn put(&self, key: &str, language: &str, value: impl Into<String>, version: i64) -> Option<(String, String)> {
        self.lock().insert((key.to_string(), language.to_string()), value.into(), version, self.capacity)
    }

    /// Current removal generation of `language`.
    pub fn generation(&self, language: &str) -> Generation {
        self.lock().generation(language)
    }

    /// Like [`MemoryCache::put`], but only if nothing of `language` was
    /// removed or cleared since `seen` was taken. Returns whether it was stored.
    pub fn put_if_current(
        &self, key: &str, language: &str, value: impl Into<String>, version: i64, seen: Generation,
    ) -> bool {
        let mut slots = self.lock();
        if slots.generation(language) != seen {
            return false;
        }
        slots.insert((key.to_string(), language.to_string()), value.into(), version, self.capacity);
        true
    }

    /// Drop one entry.
    pub fn remove(&self, key: &str, language: &str) -> bool {
        let mut slots = self.lock();
        slots.bump(language);
        slots.entries.shift_remove(&(key.to_string(), language.to_string())).is_some()
    }

    /// Drop one key in every language.
    pub fn remove_key(&self, key: &str) -> usize {
        let mut slots = self.lock();
        slots.epoch += 1;
        let before = slots.entries.len();
        slots.entries.retain(|(k, _), _| k != key);
        before - slots.entries.len()
    }

    /// Drop every entry of `language`, or everything when `None`.
    pub fn clear(&self, language: Option<&str>) -> usize {
        let mut slots = self.lock();
        let before = slots.entries.len();
        match language {
            Some(language) => {
                slots.bump(language);
                slots.entries.retain(|(_, l), _| l != language);
            }
            None => {
                slots.epoch += 1;
                slots.entries.clear();
            }
        }
        before - slots.entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fraction of lookups served from memory; 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 { 0.0 } else { hits as f64 / total as f64 }
    }

    /// Fraction of lookups that missed; 0.0 before any lookup.
    pub fn miss_rate(&self) -> f64 {
        let misses = self.misses.load(Ordering::Relaxed);
        let total = misses + self.hits.load(Ordering::Relaxed);
        if total == 0 { 0.0 } else { misses as f64 / total as f64 }
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}
