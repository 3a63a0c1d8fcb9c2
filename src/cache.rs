//! General-purpose key-value cache with per-entry TTL.
//!
//! [`KvCache`] is the seam consumed by the enrichment client and the search
//! cache. [`MemoryCache`] is the in-process implementation: expired entries
//! are evicted lazily on read and by an optional periodic sweep task.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use harvester_core::cache::{KvCache, MemoryCache};
//!
//! # async fn example() {
//! let cache = MemoryCache::new();
//! cache.set("enrich:10.1/x", "{}".to_string(), Duration::from_secs(60)).await;
//! assert!(cache.exists("enrich:10.1/x").await);
//! # }
//! ```

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Key-value cache with time-to-live semantics.
#[async_trait]
pub trait KvCache: Send + Sync {
    /// Returns the value for `key` if present and not expired.
    async fn get(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Duration);

    /// Removes `key`. Returns true if an entry was removed.
    async fn delete(&self, key: &str) -> bool;

    /// Returns true if `key` holds an unexpired value.
    async fn exists(&self, key: &str) -> bool;
}

/// Reads and decodes a JSON value from the cache.
///
/// An undecodable entry is treated as a miss and removed.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn KvCache, key: &str) -> Option<T> {
    let raw = cache.get(key).await?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(key, error = %error, "discarding undecodable cache entry");
            cache.delete(key).await;
            None
        }
    }
}

/// Encodes `value` as JSON and stores it.
pub async fn set_json<T: Serialize + Sync>(cache: &dyn KvCache, key: &str, value: &T, ttl: Duration) {
    match serde_json::to_string(value) {
        Ok(raw) => cache.set(key, raw, ttl).await,
        Err(error) => warn!(key, error = %error, "failed to encode cache entry"),
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-memory TTL cache backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until evicted.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every expired entry, returning how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Spawns a task that sweeps expired entries every `interval`.
    ///
    /// The task holds a weak reference and exits once the cache is dropped.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let evicted = cache.sweep();
                if evicted > 0 {
                    debug!(evicted, remaining = cache.len(), "cache sweep");
                }
            }
        })
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }
        // Shard guard released above; remove_if re-locks.
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    async fn exists(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }
}
