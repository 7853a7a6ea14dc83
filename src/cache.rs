//! TTL cache for API responses with in-flight sharing
//!
//! One entry per (method, url, body) key holds a shared future, so every
//! caller racing on the same key awaits the same underlying network call,
//! whether it is still in flight or already resolved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, Shared};
use reqwest::Method;

use crate::error::SpotifyError;

/// Parsed response body; `None` for empty (204-style) responses
pub type CachedBody = Option<Arc<serde_json::Value>>;

/// A cloneable handle on an in-flight-or-resolved request
pub type SharedResponse = Shared<BoxFuture<'static, Result<CachedBody, Arc<SpotifyError>>>>;

/// Composite cache key: method, url and a body fingerprint.
///
/// serde_json serializes object keys in sorted order, so two bodies that
/// differ only in key order fingerprint identically.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: Method,
    url: String,
    body: String,
}

impl CacheKey {
    pub fn new(method: &Method, url: &str, body: Option<&serde_json::Value>) -> Self {
        Self {
            method: method.clone(),
            url: url.to_string(),
            body: body
                .map(|b| b.to_string())
                .unwrap_or_else(|| "null".to_string()),
        }
    }
}

struct CacheSlot {
    response: SharedResponse,
    issued_at: Instant,
}

/// Time-boxed response cache. The timestamp of an entry is the moment the
/// underlying call was issued, not when it completed.
#[derive(Default)]
pub struct ResponseCache {
    entries: Mutex<HashMap<CacheKey, CacheSlot>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the entry for `key` if it is younger than `ttl`. An expired
    /// entry is dropped on the way out.
    pub fn get(&self, key: &CacheKey, ttl: Duration) -> Option<SharedResponse> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(slot) if slot.issued_at.elapsed() < ttl => Some(slot.response.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Record a freshly-issued call under `key`, stamped now.
    pub fn insert(&self, key: CacheKey, response: SharedResponse) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key,
            CacheSlot {
                response,
                issued_at: Instant::now(),
            },
        );
    }

    pub fn evict(&self, key: &CacheKey) {
        self.entries.lock().unwrap().remove(key);
    }

    /// Drop every entry older than `ttl`.
    pub fn purge_expired(&self, ttl: Duration) {
        self.entries
            .lock()
            .unwrap()
            .retain(|_, slot| slot.issued_at.elapsed() < ttl);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
