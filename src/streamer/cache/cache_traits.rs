//! # Cache Traits
//!
//! Policy-neutral cache interface used by caching stages.
//!
//! ```text
//!   CoreCache<K, V>          insert · get · contains · len · capacity · clear
//!        │
//!        ▼
//!   MutableCache<K, V>       remove · remove_batch · retain
//!        │
//!        ▼
//!   LRUCacheTrait<K, V>      pop_lru · peek_lru · touch · recency_rank
//! ```
//!
//! `retain` exists so a stage can drop every entry belonging to one file
//! without knowing the exact keys that were cached for it.

/// Operations every cache supports, regardless of eviction policy
pub trait CoreCache<K, V> {
    /// Inserts a value, returning the previous value for the key. May evict.
    fn insert(&mut self, key: K, value: V) -> Option<V>;

    /// Looks up a value and records the access
    fn get(&mut self, key: &K) -> Option<&V>;

    /// Looks up a key without recording an access
    fn contains(&self, key: &K) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;

    fn clear(&mut self);
}

/// Caches that support removal by key
pub trait MutableCache<K, V>: CoreCache<K, V> {
    fn remove(&mut self, key: &K) -> Option<V>;

    fn remove_batch(&mut self, keys: &[K]) -> Vec<Option<V>> {
        keys.iter().map(|key| self.remove(key)).collect()
    }

    /// Keeps only the entries for which `keep` returns true. Returns the
    /// number of entries removed.
    fn retain<F>(&mut self, keep: F) -> usize
    where
        F: FnMut(&K, &V) -> bool;
}

/// Recency-ordered eviction
pub trait LRUCacheTrait<K, V>: MutableCache<K, V> {
    /// Removes and returns the least recently used entry
    fn pop_lru(&mut self) -> Option<(K, V)>;

    fn peek_lru(&self) -> Option<(&K, &V)>;

    /// Marks an entry as most recently used. Returns false if absent.
    fn touch(&mut self, key: &K) -> bool;

    /// 0 is the most recently used entry
    fn recency_rank(&self, key: &K) -> Option<usize>;
}
