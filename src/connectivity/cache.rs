// =============================================================================
// Response Cache — short-TTL cache for idempotent REST reads
// =============================================================================

use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

use super::transport::RequestOptions;
use crate::types::{EndpointClass, Method};

/// Paths that are never cached: clock sync, live prices, order books and
/// stream endpoints.
const NO_CACHE_PATTERNS: &[&str] = &["/time", "ticker", "depth", "/ws/", "/stream"];

struct Entry {
    value: Value,
    stored_at: Instant,
}

pub struct ResponseCache {
    entries: DashMap<String, Entry>,
    ttl: Duration,
    max_entries: usize,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries,
        }
    }

    /// Whether a request is eligible for caching at all.
    pub fn is_cacheable(path: &str, options: &RequestOptions) -> bool {
        options.cacheable
            && options.method == Method::Get
            && !NO_CACHE_PATTERNS.iter().any(|p| path.contains(p))
    }

    /// Stable key over method, class, path and query.
    pub fn key(class: EndpointClass, path: &str, options: &RequestOptions) -> String {
        let mut hasher = Sha256::new();
        hasher.update(options.method.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(class.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(path.as_bytes());
        hasher.update(b"?");
        hasher.update(options.query_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let hit = self
            .entries
            .get(key)
            .filter(|e| e.stored_at.elapsed() < self.ttl)
            .map(|e| e.value.clone());
        if hit.is_none() {
            self.entries.remove_if(key, |_, e| e.stored_at.elapsed() >= self.ttl);
        }
        hit
    }

    pub fn insert(&self, key: String, value: Value) {
        if self.entries.len() >= self.max_entries {
            self.purge_expired();
        }
        if self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }
        self.entries.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.stored_at.elapsed() < self.ttl);
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) {
        let n = self.entries.len();
        self.entries.clear();
        debug!(entries = n, "response cache cleared");
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.stored_at)
            .map(|e| e.key().clone());
        if let Some(k) = oldest {
            self.entries.remove(&k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volatile_paths_and_writes_are_not_cacheable() {
        let get = RequestOptions::get();
        assert!(ResponseCache::is_cacheable("/api/v3/exchangeInfo", &get));
        assert!(!ResponseCache::is_cacheable("/api/v3/time", &get));
        assert!(!ResponseCache::is_cacheable("/api/v3/ticker/price", &get));
        assert!(!ResponseCache::is_cacheable("/api/v3/depth", &get));
        assert!(!ResponseCache::is_cacheable("/api/v3/order", &RequestOptions::post()));
        assert!(!ResponseCache::is_cacheable("/api/v3/exchangeInfo", &RequestOptions::get().no_cache()));
    }

    #[test]
    fn key_depends_on_query() {
        let a = ResponseCache::key(EndpointClass::Spot, "/api/v3/klines", &RequestOptions::get().query("symbol", "BTCUSDT"));
        let b = ResponseCache::key(EndpointClass::Spot, "/api/v3/klines", &RequestOptions::get().query("symbol", "ETHUSDT"));
        let c = ResponseCache::key(EndpointClass::Futures, "/api/v3/klines", &RequestOptions::get().query("symbol", "BTCUSDT"));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = ResponseCache::new(Duration::from_millis(100), 10);
        cache.insert("k".into(), serde_json::json!(1));
        assert_eq!(cache.get("k"), Some(serde_json::json!(1)));
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn full_cache_evicts_oldest() {
        let cache = ResponseCache::new(Duration::from_secs(60), 2);
        cache.insert("a".into(), serde_json::json!("a"));
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.insert("b".into(), serde_json::json!("b"));
        tokio::time::advance(Duration::from_millis(1)).await;
        cache.insert("c".into(), serde_json::json!("c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("c").is_some());
    }
}
