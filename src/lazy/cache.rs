//! Bounded LRU cache with idle tracking

use lru::LruCache;
use serde::Serialize;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    last_access: Instant,
}

/// Cache statistics for monitoring
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStatistics {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStatistics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// LRU cache whose size never exceeds its capacity after an insert.
pub struct BoundedCache<K: Hash + Eq, V> {
    entries: LruCache<K, Entry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<K: Hash + Eq + Clone, V: Clone> BoundedCache<K, V> {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Look up and mark as most recently used.
    pub fn get(&mut self, key: &K) -> Option<V> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_access = Instant::now();
                self.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Insert, returning the entry evicted to stay within capacity.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        let entry = Entry {
            value,
            last_access: Instant::now(),
        };
        let replaced_same_key = self.entries.contains(&key);
        let evicted = self.entries.push(key, entry)?;
        if replaced_same_key {
            return None;
        }
        self.evictions += 1;
        Some((evicted.0, evicted.1.value))
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.pop(key).map(|entry| entry.value)
    }

    /// Evict up to `count` least recently used entries.
    pub fn evict_lru(&mut self, count: usize) -> Vec<K> {
        let mut evicted = Vec::with_capacity(count.min(self.entries.len()));
        for _ in 0..count {
            match self.entries.pop_lru() {
                Some((key, _)) => evicted.push(key),
                None => break,
            }
        }
        self.evictions += evicted.len() as u64;
        evicted
    }

    /// Evict every entry not accessed within `max_age`.
    pub fn evict_idle(&mut self, max_age: Duration) -> Vec<K> {
        let now = Instant::now();
        let stale: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_access) >= max_age)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            self.entries.pop(key);
        }
        self.evictions += stale.len() as u64;
        stale
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn statistics(&self) -> CacheStatistics {
        CacheStatistics {
            size: self.entries.len(),
            capacity: self.capacity(),
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}
