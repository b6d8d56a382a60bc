//! Response cache with LRU eviction and TTL.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use gbomb_config::RequestConfig;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

#[derive(Debug, Clone)]
struct CachedResponse {
    value: Value,
    cached_at: Instant,
}

/// Graph responses keyed by cache identity and request URL.
#[derive(Debug)]
pub struct ResponseCache {
    inner: Mutex<LruCache<String, CachedResponse>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            ttl,
        }
    }

    pub fn from_config(config: &RequestConfig) -> Self {
        Self::new(config.cache_max_entries, config.cache_ttl())
    }

    /// Cache key for a request under `identity`.
    pub fn key(identity: &str, relative_url: &str) -> String {
        format!("{}|{}", identity, relative_url)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.get_at(key, Instant::now())
    }

    /// Look up `key` as of `now`; stale entries are evicted.
    pub fn get_at(&self, key: &str, now: Instant) -> Option<Value> {
        let mut inner = self.inner.lock();
        let fresh = inner
            .get(key)
            .map(|entry| now.saturating_duration_since(entry.cached_at) < self.ttl)?;
        if !fresh {
            trace!(key, "Cached response expired");
            inner.pop(key);
            return None;
        }
        inner.get(key).map(|entry| entry.value.clone())
    }

    pub fn put(&self, key: String, value: Value) {
        trace!(key = %key, "Caching response");
        self.inner.lock().put(
            key,
            CachedResponse {
                value,
                cached_at: Instant::now(),
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.inner.lock().pop(key);
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_put_and_get() {
        let cache = ResponseCache::new(4, Duration::from_secs(60));
        let key = ResponseCache::key("user-1", "me");
        cache.put(key.clone(), json!({"id": "1"}));
        assert_eq!(cache.get(&key), Some(json!({"id": "1"})));
        assert!(cache.get(&ResponseCache::key("user-2", "me")).is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = ResponseCache::new(4, Duration::from_secs(60));
        cache.put("k".into(), json!(1));
        let later = Instant::now() + Duration::from_secs(61);
        assert!(cache.get_at("k", later).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ResponseCache::new(2, Duration::from_secs(60));
        cache.put("a".into(), json!(1));
        cache.put("b".into(), json!(2));
        cache.get("a");
        cache.put("c".into(), json!(3));
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert_eq!(cache.len(), 2);
    }
}
