// galena-core/src/query_cache.rs
// Per-collection plan cache with LRU eviction. The planner caches which
// index served a query shape; any write to the collection invalidates the
// whole cache through notify_of_write().

use lru::LruCache;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;

/// Hash of a query shape within one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryHash(u64);

impl QueryHash {
    pub fn new(query: &Value) -> QueryHash {
        let mut hasher = DefaultHasher::new();
        // serde_json serialization is stable for a given value, so this is
        // deterministic across lookups.
        let query_str = serde_json::to_string(query).unwrap_or_default();
        query_str.hash(&mut hasher);
        QueryHash(hasher.finish())
    }
}

/// A cached plan: the index chosen for a query shape, or None for a
/// primary-index scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPlan {
    pub index_name: Option<String>,
}

pub struct QueryCache {
    cache: RwLock<LruCache<QueryHash, CachedPlan>>,
    capacity: usize,
}

impl QueryCache {
    pub fn new(capacity: usize) -> QueryCache {
        let capacity_nz = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(128).unwrap());
        QueryCache {
            cache: RwLock::new(LruCache::new(capacity_nz)),
            capacity,
        }
    }

    pub fn get(&self, hash: &QueryHash) -> Option<CachedPlan> {
        self.cache.read().peek(hash).cloned()
    }

    pub fn insert(&self, hash: QueryHash, plan: CachedPlan) {
        self.cache.write().put(hash, plan);
    }

    /// Write-invalidation notification. Called by every insert, update and
    /// delete on the owning collection.
    pub fn notify_of_write(&self) {
        self.cache.write().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_deterministic() {
        let q = json!({"a": {"$exists": true}});
        assert_eq!(QueryHash::new(&q), QueryHash::new(&q));
        assert_ne!(QueryHash::new(&q), QueryHash::new(&json!({"b": 1})));
    }

    #[test]
    fn test_insert_get() {
        let cache = QueryCache::new(16);
        let hash = QueryHash::new(&json!({"a": 1}));
        cache.insert(
            hash,
            CachedPlan {
                index_name: Some("a_1".to_string()),
            },
        );
        assert_eq!(
            cache.get(&hash).unwrap().index_name.as_deref(),
            Some("a_1")
        );
    }

    #[test]
    fn test_write_invalidates() {
        let cache = QueryCache::new(16);
        let hash = QueryHash::new(&json!({"a": 1}));
        cache.insert(hash, CachedPlan { index_name: None });
        assert!(cache.get(&hash).is_some());
        cache.notify_of_write();
        assert!(cache.get(&hash).is_none());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = QueryCache::new(2);
        let h1 = QueryHash::new(&json!({"a": 1}));
        let h2 = QueryHash::new(&json!({"b": 1}));
        let h3 = QueryHash::new(&json!({"c": 1}));
        cache.insert(h1, CachedPlan { index_name: None });
        cache.insert(h2, CachedPlan { index_name: None });
        cache.insert(h3, CachedPlan { index_name: None });
        assert!(cache.get(&h1).is_none());
        assert!(cache.get(&h2).is_some());
        assert!(cache.get(&h3).is_some());
    }
}
