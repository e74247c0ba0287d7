use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use super::cache_traits::{CoreCache, LRUCacheTrait, MutableCache};

/// LRU cache. Every access stamps the entry with a new sequence number; the
/// ordered stamp index makes eviction and touch O(log n).
#[derive(Debug)]
pub struct LRUCache<K, V>
where
    K: Eq + Hash + Clone,
{
    capacity: usize,
    entries: HashMap<K, (V, u64)>,
    recency: BTreeMap<u64, K>,
    next_stamp: u64,
}

impl<K, V> LRUCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            recency: BTreeMap::new(),
            next_stamp: 0,
        }
    }

    fn stamp(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }

    /// Moves `key` to the most recently used position. Caller guarantees the
    /// key is present.
    fn refresh(&mut self, key: &K) {
        let stamp = self.stamp();
        if let Some((_, old)) = self.entries.get_mut(key) {
            self.recency.remove(&*old);
            *old = stamp;
            self.recency.insert(stamp, key.clone());
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }
}

impl<K, V> CoreCache<K, V> for LRUCache<K, V>
where
    K: Eq + Hash + Clone,
{
    fn insert(&mut self, key: K, value: V) -> Option<V> {
        if self.capacity == 0 {
            return None;
        }
        if self.entries.contains_key(&key) {
            self.refresh(&key);
            return self
                .entries
                .get_mut(&key)
                .map(|(current, _)| std::mem::replace(current, value));
        }
        if self.entries.len() >= self.capacity {
            self.pop_lru();
        }
        let stamp = self.stamp();
        self.recency.insert(stamp, key.clone());
        self.entries.insert(key, (value, stamp));
        None
    }

    fn get(&mut self, key: &K) -> Option<&V> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.refresh(key);
        self.entries.get(key).map(|(value, _)| value)
    }

    fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }
}

impl<K, V> MutableCache<K, V> for LRUCache<K, V>
where
    K: Eq + Hash + Clone,
{
    fn remove(&mut self, key: &K) -> Option<V> {
        let (value, stamp) = self.entries.remove(key)?;
        self.recency.remove(&stamp);
        Some(value)
    }

    fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
    {
        let before = self.entries.len();
        let recency = &mut self.recency;
        self.entries.retain(|key, (value, stamp)| {
            let kept = keep(key, value);
            if !kept {
                recency.remove(&*stamp);
            }
            kept
        });
        before - self.entries.len()
    }
}

impl<K, V> LRUCacheTrait<K, V> for LRUCache<K, V>
where
    K: Eq + Hash + Clone,
{
    fn pop_lru(&mut self) -> Option<(K, V)> {
        let (_, key) = self.recency.pop_first()?;
        let (value, _) = self.entries.remove(&key)?;
        Some((key, value))
    }

    fn peek_lru(&self) -> Option<(&K, &V)> {
        let (_, key) = self.recency.first_key_value()?;
        self.entries.get_key_value(key).map(|(key, (value, _))| (key, value))
    }

    fn touch(&mut self, key: &K) -> bool {
        if !self.entries.contains_key(key) {
            return false;
        }
        self.refresh(key);
        true
    }

    fn recency_rank(&self, key: &K) -> Option<usize> {
        let (_, stamp) = self.entries.get(key)?;
        Some(self.recency.range(stamp + 1..).count())
    }
}
