//! Bounded in-memory LRU map.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Default capacity for the validation memo.
pub const DEFAULT_LRU_CAPACITY: usize = 512;

/// Bounded map evicting the least recently inserted-or-read key.
#[derive(Debug, Clone)]
pub struct LruCache<K, V> {
    /// Cached entries (key -> value)
    entries: HashMap<K, V>,
    /// LRU order (front = oldest, back = newest)
    lru_order: VecDeque<K>,
    capacity: usize,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Creates an empty cache. A capacity of 0 is treated as 1.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: HashMap::with_capacity(capacity),
            lru_order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns the value for `key`, marking it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if self.entries.contains_key(key) {
            self.touch(key);
            self.entries.get(key)
        } else {
            None
        }
    }

    /// Returns the value for `key` without touching recency.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Returns true if `key` is cached. Does not touch recency.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts or replaces a value.
    ///
    /// Replacing refreshes recency without growing the cache. Inserting a new
    /// key at capacity evicts the oldest entry, which is returned.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        if let Some(slot) = self.entries.get_mut(&key) {
            *slot = value;
            self.touch(&key);
            return None;
        }

        let mut evicted = None;
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.lru_order.pop_front() else {
                break;
            };
            if let Some(value) = self.entries.remove(&oldest) {
                evicted = Some((oldest, value));
            }
        }

        self.entries.insert(key.clone(), value);
        self.lru_order.push_back(key);
        evicted
    }

    /// Removes `key`, returning its value.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.entries.remove(key)?;
        self.lru_order.retain(|k| k != key);
        Some(value)
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Move a key to the back of the LRU queue (most recently used)
    fn touch(&mut self, key: &K) {
        self.lru_order.retain(|k| k != key);
        self.lru_order.push_back(key.clone());
    }
}
