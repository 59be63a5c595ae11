use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

/// A copy-on-write hash map for registries that are read on the hot path (frame
///  dispatch) and written rarely (stream open/close).
///
/// Readers grab an `Arc` snapshot under a briefly-held lock and then work on the
///  snapshot, so no lock is ever held across dispatch into handler code. Writers clone
///  the map, apply the change and swap the `Arc`.
pub struct AtomicMap<K, V> {
    map: RwLock<Arc<FxHashMap<K, V>>>,
}

impl<K: Hash + Eq + Clone, V: Clone> Default for AtomicMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone, V: Clone> AtomicMap<K, V> {
    pub fn new() -> AtomicMap<K, V> {
        AtomicMap {
            map: RwLock::new(Arc::new(FxHashMap::default())),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.snapshot().get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.snapshot().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// A point-in-time view, detached from subsequent updates.
    pub fn snapshot(&self) -> Arc<FxHashMap<K, V>> {
        self.map.read().unwrap().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut FxHashMap<K, V>)) {
        let mut guard = self.map.write().unwrap();
        let mut map: FxHashMap<K, V> = (**guard).clone();
        f(&mut map);
        *guard = Arc::new(map);
    }

    /// Inserts `value` unless the key is already present. Returns false on conflict.
    pub fn try_insert(&self, key: K, value: V) -> bool {
        let mut guard = self.map.write().unwrap();
        if guard.contains_key(&key) {
            return false;
        }
        let mut map: FxHashMap<K, V> = (**guard).clone();
        map.insert(key, value);
        *guard = Arc::new(map);
        true
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut guard = self.map.write().unwrap();
        if !guard.contains_key(key) {
            return None;
        }
        let mut map: FxHashMap<K, V> = (**guard).clone();
        let removed = map.remove(key);
        *guard = Arc::new(map);
        removed
    }

    /// Removes all entries and returns the previous content.
    pub fn drain(&self) -> Arc<FxHashMap<K, V>> {
        let mut guard = self.map.write().unwrap();
        std::mem::replace(&mut *guard, Arc::new(FxHashMap::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let map = AtomicMap::<u32, u32>::new();

        assert!(map.try_insert(1, 2));
        assert_eq!(Some(2), map.get(&1));
        assert!(!map.try_insert(1, 3), "duplicate key must be refused");
        assert_eq!(Some(2), map.get(&1));

        assert_eq!(Some(2), map.remove(&1));
        assert_eq!(None, map.remove(&1));
        assert!(map.is_empty());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let map = AtomicMap::<u32, u32>::new();
        map.try_insert(1, 1);

        let snapshot = map.snapshot();
        map.try_insert(2, 2);

        assert_eq!(1, snapshot.len());
        assert_eq!(2, map.len());
    }

    #[test]
    fn test_drain() {
        let map = AtomicMap::<u32, u32>::new();
        map.try_insert(1, 1);
        map.try_insert(2, 2);

        let drained = map.drain();
        assert_eq!(2, drained.len());
        assert!(map.is_empty());
    }

    #[test]
    fn test_update() {
        let map = AtomicMap::<u32, u32>::new();
        map.update(|m| {
            m.insert(1, 2);
        });
        assert_eq!(Some(2), map.get(&1));
    }
}
