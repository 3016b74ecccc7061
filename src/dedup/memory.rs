//! Process-local LRU dedup store.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use async_trait::async_trait;
use lru::LruCache;

use super::DedupStore;

/// Bounded in-memory dedup set. Eviction order is least-recently-seen, so
/// the horizon shrinks to the hottest keys under pressure. State does not
/// survive a restart.
pub struct LruDedupStore {
    cache: Mutex<LruCache<String, ()>>,
}

impl LruDedupStore {
    /// A zero capacity is clamped to one entry.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl DedupStore for LruDedupStore {
    async fn is_duplicate(&self, key: &str) -> bool {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        // get() rather than contains() so a hit refreshes recency.
        cache.get(key).is_some()
    }

    async fn mark(&self, key: &str) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.put(key.to_string(), ());
    }
}
