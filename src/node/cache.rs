//! Fallback cache of node responses, keyed by query signature.
//!
//! Every live response overwrites its entry. Entries never expire here:
//! the client serves them stale-or-not once retries are exhausted, and the
//! TTL is only exposed as an advisory freshness check.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// A cached response with the time it was fetched.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub data: Value,
    pub fetched_at: DateTime<Utc>,
}

/// Thread-safe response cache. DashMap shards guard each key independently.
#[derive(Clone, Default)]
pub struct ResponseCache {
    /// query signature → last good response
    entries: Arc<DashMap<String, CachedResponse>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, signature: &str) -> Option<CachedResponse> {
        self.entries.get(signature).map(|e| e.clone())
    }

    /// Insert or overwrite the entry for `signature`.
    pub fn insert(&self, signature: &str, data: Value) {
        self.insert_at(signature, data, Utc::now());
    }

    pub fn insert_at(&self, signature: &str, data: Value, fetched_at: DateTime<Utc>) {
        self.entries
            .insert(signature.to_string(), CachedResponse { data, fetched_at });
    }

    /// Whether the entry exists and is younger than `ttl`. Advisory only.
    pub fn is_fresh(&self, signature: &str, ttl: Duration) -> bool {
        let Some(entry) = self.entries.get(signature) else {
            return false;
        };
        let age = Utc::now().signed_duration_since(entry.fetched_at);
        age.to_std().map(|a| a <= ttl).unwrap_or(true)
    }

    /// Number of cached signatures.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_overwrites() {
        let cache = ResponseCache::new();
        cache.insert("/", json!({"ledger_version": "1"}));
        cache.insert("/", json!({"ledger_version": "2"}));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("/").unwrap().data["ledger_version"], "2");
    }

    #[test]
    fn test_freshness_is_advisory() {
        let cache = ResponseCache::new();
        let old = Utc::now() - chrono::Duration::hours(2);
        cache.insert_at("/old", json!(1), old);
        cache.insert("/new", json!(2));

        assert!(!cache.is_fresh("/old", Duration::from_secs(60)));
        assert!(cache.is_fresh("/new", Duration::from_secs(60)));
        assert!(!cache.is_fresh("/missing", Duration::from_secs(60)));
        // Stale entries are still returned.
        assert_eq!(cache.get("/old").unwrap().data, json!(1));
    }
}
