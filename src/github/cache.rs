//! Conditional response cache for the GitHub client.
//!
//! Entries are keyed by the logical request (path plus query string) and hold
//! the payload together with the validator (`ETag`) it was served with. A
//! payload only changes through [`ResponseCache::store`], i.e. when the API
//! returned fresh content; a "not modified" answer goes through
//! [`ResponseCache::touch`], which refreshes the fetch time only.
//!
//! The cache is an explicit object owned by whoever builds the client, so two
//! clients never share state by accident. Writes to one key are a single map
//! replace; concurrent refreshes of the same key are last-writer-wins.

use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fetched_at: Instant,
    pub validator: Option<String>,
    pub payload: Value,
}

impl CacheEntry {
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Replace the entry with new content from the API.
    pub async fn store(&self, key: &str, validator: Option<String>, payload: Value) {
        let entry = CacheEntry {
            fetched_at: Instant::now(),
            validator,
            payload,
        };
        self.entries.lock().await.insert(key.to_string(), entry);
    }

    /// Mark an entry as revalidated and hand back its unchanged payload.
    pub async fn touch(&self, key: &str) -> Option<Value> {
        let mut guard = self.entries.lock().await;
        let entry = guard.get_mut(key)?;
        entry.fetched_at = Instant::now();
        Some(entry.payload.clone())
    }

    pub async fn evict(&self, key: &str) -> bool {
        self.entries.lock().await.remove(key).is_some()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

/// Stable key for a request: the path without a leading slash, then the query
/// pairs in the order given.
pub fn cache_key(path: &str, query: &[(&str, String)]) -> String {
    let path = path.trim_start_matches('/');
    if query.is_empty() {
        return path.to_string();
    }
    let qs = query
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", path, qs)
}
