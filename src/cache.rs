//! Small TTL cache with bounded capacity.
//!
//! Owned by the service that needs it and passed in at construction; nothing
//! in the crate shares cache state implicitly.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// Capacity-bounded map whose entries expire after a fixed TTL.
/// Interior mutability; all operations take `&self`.
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    ttl: Duration,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut map = self.entries.lock();
        match map.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let mut map = self.entries.lock();

        // Drop expired entries first, then the oldest live one if still full.
        if map.len() >= self.capacity && !map.contains_key(&key) {
            let ttl = self.ttl;
            map.retain(|_, e| e.inserted_at.elapsed() < ttl);
            if map.len() >= self.capacity {
                if let Some(oldest) = map
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone())
                {
                    map.remove(&oldest);
                }
            }
        }

        map.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn evict(&self, key: &K) {
        self.entries.lock().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_inserted_value() {
        let cache: TtlCache<String, i64> = TtlCache::new(Duration::from_secs(60), 10);
        cache.insert("CNY:KGS".to_string(), 12);
        assert_eq!(cache.get(&"CNY:KGS".to_string()), Some(12));
        assert_eq!(cache.get(&"USD:KGS".to_string()), None);
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache: TtlCache<&str, i64> = TtlCache::new(Duration::from_millis(0), 10);
        cache.insert("k", 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache: TtlCache<u32, u32> = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert(1, 1);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(2, 2);
        std::thread::sleep(Duration::from_millis(2));
        cache.insert(3, 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&3), Some(3));
    }

    #[test]
    fn reinserting_existing_key_does_not_evict() {
        let cache: TtlCache<u32, u32> = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert(1, 1);
        cache.insert(2, 2);
        cache.insert(1, 10);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.get(&2), Some(2));
    }
}
