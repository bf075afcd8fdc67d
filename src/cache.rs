//! Bounded LRU cache with per-entry time-to-live.
//!
//! Instances are owned by the component that writes the underlying data, so
//! that component can invalidate entries on every mutation. A zero TTL turns
//! the cache into a no-op.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct TtlCache<K: Hash + Eq, V: Clone> {
    entries: Mutex<LruCache<K, (Instant, V)>>,
    ttl: Duration,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.ttl.is_zero()
    }

    /// Returns a clone of the cached value if present and not expired; expired entries are
    /// evicted on access.
    pub async fn get(&self, key: &K) -> Option<V> {
        if !self.is_enabled() {
            return None;
        }

        let mut entries = self.entries.lock().await;
        let expired = match entries.get(key) {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => {
                return Some(value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    pub async fn insert(&self, key: K, value: V) {
        if !self.is_enabled() {
            return;
        }
        self.entries.lock().await.put(key, (Instant::now(), value));
    }

    pub async fn invalidate(&self, key: &K) {
        self.entries.lock().await.pop(key);
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
