//! Bounded, TTL-expiring response memo.

use super::key::hex_digest;
use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_CAPACITY: usize = 1024;

struct CachedResponse<V> {
    value: V,
    created_at: Instant,
}

/// In-memory LRU of generated responses, each valid for `ttl` after insertion.
pub struct ResponseCache<V> {
    entries: Mutex<LruCache<String, CachedResponse<V>>>,
    ttl: Duration,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Stable key for a request: SHA-256 over the model id and the request's canonical JSON.
    pub fn key_for<R: Serialize>(model: &str, request: &R) -> String {
        let body = serde_json::to_string(request).unwrap_or_default();
        let mut data = Vec::with_capacity(model.len() + body.len() + 1);
        data.extend_from_slice(model.as_bytes());
        data.push(0);
        data.extend_from_slice(body.as_bytes());
        hex_digest(&data)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().ok()?;
        let expired = match entries.get(key) {
            Some(entry) if entry.created_at.elapsed() < self.ttl => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    pub fn insert(&self, key: String, value: V) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.put(
                key,
                CachedResponse {
                    value,
                    created_at: Instant::now(),
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
