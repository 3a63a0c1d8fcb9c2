//! Merged search result sets cached by query digest.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cache::{KvCache, get_json, set_json};

use super::{DatabaseFailure, SearchQuery, SearchResult};

/// Default freshness window for a cached result set.
pub const DEFAULT_SEARCH_TTL: Duration = Duration::from_secs(3600);

/// A merged, sorted, unsliced result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResults {
    /// Every merged hit, newest first.
    pub results: Vec<SearchResult>,
    /// Connector ids that answered.
    pub databases: Vec<String>,
    /// Connectors that failed when the set was built.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<DatabaseFailure>,
    /// Results requested from each connector.
    pub window: u32,
    /// When the set was built.
    pub stored_at: DateTime<Utc>,
}

impl CachedResults {
    /// Age of the entry; zero if `stored_at` lies in the future.
    #[must_use]
    pub fn age(&self) -> Duration {
        (Utc::now() - self.stored_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Outcome of a cache read.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Within TTL.
    Fresh(CachedResults),
    /// Past TTL, returned because stale serving is on.
    Stale(CachedResults),
}

/// Search cache over a [`KvCache`].
///
/// Entries are valid while younger than the TTL. Expired entries are
/// deleted on read unless stale serving is enabled, in which case they stay
/// in the underlying cache for one more TTL and are returned as
/// [`CacheLookup::Stale`].
#[derive(Clone)]
pub struct SearchCache {
    kv: Arc<dyn KvCache>,
    ttl: Duration,
    serve_stale: bool,
}

impl std::fmt::Debug for SearchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchCache")
            .field("ttl", &self.ttl)
            .field("serve_stale", &self.serve_stale)
            .finish_non_exhaustive()
    }
}

impl SearchCache {
    /// Creates a cache with the default TTL and no stale serving.
    #[must_use]
    pub fn new(kv: Arc<dyn KvCache>) -> Self {
        Self {
            kv,
            ttl: DEFAULT_SEARCH_TTL,
            serve_stale: false,
        }
    }

    /// Sets the freshness window.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Enables stale-while-revalidate reads.
    #[must_use]
    pub fn with_serve_stale(mut self, serve_stale: bool) -> Self {
        self.serve_stale = serve_stale;
        self
    }

    /// Cache key: `search:` plus the SHA-256 hex of the normalized query and
    /// the sorted connector ids.
    #[must_use]
    pub fn key(query: &SearchQuery, database_ids: &[String]) -> String {
        let mut ids: Vec<&str> = database_ids.iter().map(String::as_str).collect();
        ids.sort_unstable();
        ids.dedup();
        let identity = serde_json::json!({
            "query": query.cache_form(),
            "databases": ids,
        });

        let mut hasher = Sha256::new();
        hasher.update(identity.to_string().as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        format!("search:{hex}")
    }

    /// Reads `key`.
    pub async fn lookup(&self, key: &str) -> Option<CacheLookup> {
        let Some(entry) = get_json::<CachedResults>(self.kv.as_ref(), key).await else {
            debug!(key, "search cache miss");
            return None;
        };
        if entry.age() < self.ttl {
            debug!(key, hits = entry.results.len(), "search cache hit");
            return Some(CacheLookup::Fresh(entry));
        }
        if self.serve_stale {
            debug!(key, age_secs = entry.age().as_secs(), "serving stale search results");
            return Some(CacheLookup::Stale(entry));
        }
        debug!(key, "search cache entry expired");
        self.kv.delete(key).await;
        None
    }

    /// Writes `entry` under `key`.
    pub async fn store(&self, key: &str, entry: &CachedResults) {
        let retention = if self.serve_stale {
            self.ttl.saturating_mul(2)
        } else {
            self.ttl
        };
        set_json(self.kv.as_ref(), key, entry, retention.max(Duration::from_secs(1))).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::search::SearchFilters;

    fn entry(stored_at: DateTime<Utc>) -> CachedResults {
        CachedResults {
            results: vec![SearchResult {
                id: "r1".to_string(),
                database: "local".to_string(),
                title: "One".to_string(),
                ..SearchResult::default()
            }],
            databases: vec!["local".to_string()],
            errors: Vec::new(),
            window: 100,
            stored_at,
        }
    }

    #[test]
    fn test_key_ignores_case_page_and_database_order() {
        let dbs_a = vec!["openalex".to_string(), "crossref".to_string()];
        let dbs_b = vec!["crossref".to_string(), "openalex".to_string()];
        let a = SearchCache::key(&SearchQuery::new("Climate "), &dbs_a);
        let b = SearchCache::key(&SearchQuery::new("climate").with_page(3), &dbs_b);
        assert_eq!(a, b);
        assert!(a.starts_with("search:"));
        assert_eq!(a.len(), "search:".len() + 64);
    }

    #[test]
    fn test_key_separates_filters_limits_and_databases() {
        let dbs = vec!["local".to_string()];
        let base = SearchCache::key(&SearchQuery::new("x"), &dbs);

        let mut filtered = SearchQuery::new("x");
        filtered.filters = SearchFilters {
            date_from: Some("2020".to_string()),
            ..SearchFilters::default()
        };
        assert_ne!(base, SearchCache::key(&filtered, &dbs));
        assert_ne!(base, SearchCache::key(&SearchQuery::new("x").with_limit(5), &dbs));
        assert_ne!(base, SearchCache::key(&SearchQuery::new("x"), &["crossref".to_string()]));
    }

    #[tokio::test]
    async fn test_fresh_entry_is_returned() {
        let cache = SearchCache::new(Arc::new(MemoryCache::new()));
        cache.store("k", &entry(Utc::now())).await;
        assert!(matches!(cache.lookup("k").await, Some(CacheLookup::Fresh(_))));
    }

    #[tokio::test]
    async fn test_expired_entry_is_deleted_on_read() {
        let kv = Arc::new(MemoryCache::new());
        let cache = SearchCache::new(kv.clone());
        cache
            .store("k", &entry(Utc::now() - chrono::Duration::hours(2)))
            .await;
        assert!(cache.lookup("k").await.is_none());
        assert!(!kv.exists("k").await);
    }

    #[tokio::test]
    async fn test_expired_entry_is_stale_when_enabled() {
        let kv = Arc::new(MemoryCache::new());
        let cache = SearchCache::new(kv.clone()).with_serve_stale(true);
        cache
            .store("k", &entry(Utc::now() - chrono::Duration::hours(2)))
            .await;
        assert!(matches!(cache.lookup("k").await, Some(CacheLookup::Stale(_))));
        assert!(kv.exists("k").await);
    }
}
