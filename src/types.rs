use std::collections::HashMap;
use std::hash::Hash;

use crossbeam::sync::ShardedLock;

use crate::error::TreeError;

pub type TreeResult<T> = Result<T, TreeError>;

/// A read-mostly concurrent map. Lookups take the sharded read lock,
/// mutations the write lock.
pub struct ConcurrentHashMap<K, V> {
    inner: ShardedLock<HashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> ConcurrentHashMap<K, V> {
    pub fn new() -> Self {
        Self {
            inner: ShardedLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, k: &K) -> Option<V> {
        self.inner.read().unwrap().get(k).cloned()
    }

    pub fn insert(&self, k: K, v: V) -> Option<V> {
        self.inner.write().unwrap().insert(k, v)
    }

    pub fn remove(&self, k: &K) -> Option<V> {
        self.inner.write().unwrap().remove(k)
    }

    pub fn get_or_insert_with(&self, k: &K, f: impl FnOnce() -> V) -> V {
        if let Some(v) = self.get(k) {
            return v;
        }
        let mut guard = self.inner.write().unwrap();
        guard.entry(k.clone()).or_insert_with(f).clone()
    }

    /// Replace the value only when it still matches `expected`; one short
    /// critical section.
    pub fn compare_and_set(&self, k: &K, expected: &V, new: V) -> bool
    where
        V: PartialEq,
    {
        let mut guard = self.inner.write().unwrap();
        match guard.get(k) {
            Some(current) if current == expected => {
                guard.insert(k.clone(), new);
                true
            }
            _ => false,
        }
    }

    pub fn contains_key(&self, k: &K) -> bool {
        self.inner.read().unwrap().contains_key(k)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn clear(&self) {
        self.inner.write().unwrap().clear();
    }

    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for (k, v) in self.inner.read().unwrap().iter() {
            f(k, v);
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for ConcurrentHashMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
