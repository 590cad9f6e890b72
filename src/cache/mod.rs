//! Response cache for vision-stage results
//!
//! Content-addressed get-or-compute cache: keys are the sha256 of the image
//! bytes plus a stage identifier and any context parameters that change the
//! result (e.g. the excluded sibling names for the portion stage). Values
//! are stored as serialized JSON, so a cache hit deserializes into exactly
//! the same shape a fresh computation produces.
//!
//! The cache is an injected trait so alternative backends can pick their
//! own concurrency primitive; the default in-process implementation uses a
//! `RwLock` map with last-writer-wins semantics.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

/// Default TTL for vision-stage results
pub const VISION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Injected get-or-compute cache interface
pub trait ResponseCache: Send + Sync {
    /// Get a non-expired value
    fn get(&self, key: &str) -> Option<String>;
    /// Store a value with a time-to-live
    fn set(&self, key: &str, value: String, ttl: Duration);
}

/// Build a content-addressed cache key from image bytes, a stage
/// identifier, and the context parameters relevant to that stage.
pub fn cache_key(stage: &str, image: &[u8], context: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image);
    for part in context {
        // Separator byte keeps ["ab","c"] distinct from ["a","bc"]
        hasher.update([0u8]);
        hasher.update(part.as_bytes());
    }
    format!("{}:{:x}", stage, hasher.finalize())
}

/// Fetch and deserialize a cached value; a stale or unparseable entry
/// reads as a miss so the caller recomputes.
pub fn get_json<T: DeserializeOwned>(cache: &dyn ResponseCache, key: &str) -> Option<T> {
    let raw = cache.get(key)?;
    match serde_json::from_str(&raw) {
        Ok(value) => {
            debug!(key, "response cache hit");
            Some(value)
        }
        Err(_) => None,
    }
}

/// Serialize and store a value (best-effort; serialization of these types
/// does not fail in practice).
pub fn set_json<T: Serialize>(cache: &dyn ResponseCache, key: &str, value: &T, ttl: Duration) {
    if let Ok(raw) = serde_json::to_string(value) {
        cache.set(key, raw, ttl);
    }
}

struct CacheEntry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// In-process response cache backed by a `RwLock` map
#[derive(Default)]
pub struct MemoryResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries
    pub fn purge_expired(&self) {
        let now = Utc::now();
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|_, entry| entry.expires_at > now);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }
}

impl ResponseCache for MemoryResponseCache {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().ok()?;
        let entry = entries.get(key)?;
        if entry.expires_at <= Utc::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    fn set(&self, key: &str, value: String, ttl: Duration) {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(24));
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(
                key.to_string(),
                CacheEntry {
                    value,
                    expires_at: Utc::now() + ttl,
                },
            );
        }
    }
}
