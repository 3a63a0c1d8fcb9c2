//! Federated search: connector selection, fan-out, merge, and pagination.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::record::date_sort_key;

use super::{
    CacheLookup, CachedResults, DEFAULT_MAX_LIMIT, DatabaseConnector, DatabaseFailure,
    SearchCache, SearchError, SearchQuery, SearchResponse, SearchResult,
};

/// Pages of results fetched per connector on a first-page miss.
pub const DEFAULT_WINDOW_PAGES: u32 = 5;

/// Aggregator tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorSettings {
    /// Hard cap on the page size.
    pub max_limit: u32,
    /// Each connector is asked for `limit * max(page, window_pages)` hits,
    /// capped at `max_limit * window_pages` and at the smallest
    /// [`DatabaseConnector::max_results`] among the selected connectors.
    pub window_pages: u32,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            max_limit: DEFAULT_MAX_LIMIT,
            window_pages: DEFAULT_WINDOW_PAGES,
        }
    }
}

impl AggregatorSettings {
    fn max_window(&self) -> u32 {
        self.max_limit.saturating_mul(self.window_pages.max(1))
    }

    fn window(&self, query: &SearchQuery) -> u32 {
        query
            .limit
            .saturating_mul(query.page.max(self.window_pages.max(1)))
            .min(self.max_window())
    }
}

/// Removes a key from the in-flight refresh set when dropped.
struct RefreshGuard {
    refreshing: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.refreshing.remove(&self.key);
    }
}

/// Runs one query across every selected connector and merges the answers.
pub struct SearchAggregator {
    connectors: Vec<Arc<dyn DatabaseConnector>>,
    cache: Option<SearchCache>,
    settings: AggregatorSettings,
    // Cache keys with a background refresh running.
    refreshing: Arc<DashMap<String, ()>>,
}

impl std::fmt::Debug for SearchAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchAggregator")
            .field(
                "connectors",
                &self.connectors.iter().map(|c| c.id()).collect::<Vec<_>>(),
            )
            .field("cache", &self.cache)
            .field("settings", &self.settings)
            .finish()
    }
}

impl SearchAggregator {
    /// Creates an aggregator without a cache.
    #[must_use]
    pub fn new(connectors: Vec<Arc<dyn DatabaseConnector>>, settings: AggregatorSettings) -> Self {
        Self {
            connectors,
            cache: None,
            settings,
            refreshing: Arc::new(DashMap::new()),
        }
    }

    /// Attaches a result cache.
    #[must_use]
    pub fn with_cache(mut self, cache: SearchCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Ids of every registered connector.
    #[must_use]
    pub fn connector_ids(&self) -> Vec<String> {
        self.connectors.iter().map(|c| c.id().to_string()).collect()
    }

    /// Searches every enabled connector `user_id` may use, optionally
    /// restricted to the ids in `database_filter`.
    ///
    /// Connector failures are reported in [`SearchResponse::errors`] and do
    /// not fail the call.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::InvalidQuery`] for an empty or malformed query
    /// and [`SearchError::NoDatabasesAvailable`] when no connector is selected.
    #[instrument(skip(self, query), fields(term = %query.term, page = query.page))]
    pub async fn search(
        &self,
        user_id: Option<&str>,
        query: &SearchQuery,
        database_filter: Option<&[String]>,
    ) -> Result<SearchResponse, SearchError> {
        let query = query.validated(self.settings.max_limit)?;
        let selected = self.select(user_id, database_filter).await;
        if selected.is_empty() {
            return Err(SearchError::NoDatabasesAvailable);
        }
        let ids: Vec<String> = selected.iter().map(|c| c.id().to_string()).collect();
        let reach = selected
            .iter()
            .map(|c| c.max_results())
            .min()
            .unwrap_or(u32::MAX);
        let window = self.settings.window(&query).min(reach);
        // No refetch can return more than this.
        let ceiling = self.settings.max_window().min(reach);
        let needed = query.page.saturating_mul(query.limit);

        let key = SearchCache::key(&query, &ids);
        if let Some(cache) = &self.cache
            && let Some(lookup) = cache.lookup(&key).await
        {
            let (entry, stale) = match lookup {
                CacheLookup::Fresh(entry) => (entry, false),
                CacheLookup::Stale(entry) => (entry, true),
            };
            if needed <= entry.window || entry.window >= ceiling {
                if stale {
                    self.spawn_refresh(cache.clone(), key, selected, &query, entry.window);
                }
                return Ok(paginate(entry, &query, true, stale));
            }
            debug!(needed, cached_window = entry.window, "cached window too small");
        }

        let entry = fan_out(&selected, &query, window).await;
        if let Some(cache) = &self.cache
            && !entry.databases.is_empty()
        {
            cache.store(&key, &entry).await;
        }
        info!(
            hits = entry.results.len(),
            databases = entry.databases.len(),
            failures = entry.errors.len(),
            "federated search finished"
        );
        Ok(paginate(entry, &query, false, false))
    }

    async fn select(
        &self,
        user_id: Option<&str>,
        database_filter: Option<&[String]>,
    ) -> Vec<Arc<dyn DatabaseConnector>> {
        let filter = database_filter.filter(|ids| !ids.is_empty());
        let mut selected = Vec::new();
        for connector in &self.connectors {
            if !connector.is_enabled() {
                continue;
            }
            if let Some(ids) = filter
                && !ids.iter().any(|id| id == connector.id())
            {
                continue;
            }
            if !connector.validate_access(user_id).await {
                debug!(database = connector.id(), "caller not authorized for database");
                continue;
            }
            selected.push(Arc::clone(connector));
        }
        selected
    }

    /// Rebuilds a stale entry in the background, unless a refresh of the
    /// same key is already running.
    fn spawn_refresh(
        &self,
        cache: SearchCache,
        key: String,
        connectors: Vec<Arc<dyn DatabaseConnector>>,
        query: &SearchQuery,
        window: u32,
    ) {
        if self.refreshing.insert(key.clone(), ()).is_some() {
            debug!(key = %key, "stale search refresh already running");
            return;
        }
        let guard = RefreshGuard {
            refreshing: Arc::clone(&self.refreshing),
            key,
        };
        let query = query.clone();
        tokio::spawn(async move {
            let key = &guard.key;
            let entry = fan_out(&connectors, &query, window).await;
            if entry.databases.is_empty() {
                warn!(key = %key, "stale search refresh failed on every database");
                return;
            }
            cache.store(key, &entry).await;
            debug!(key = %key, hits = entry.results.len(), "stale search entry refreshed");
        });
    }
}

/// Queries `connectors` concurrently for `window` hits each and merges the
/// successful answers newest first.
async fn fan_out(
    connectors: &[Arc<dyn DatabaseConnector>],
    query: &SearchQuery,
    window: u32,
) -> CachedResults {
    let fetch = query.clone().with_page(1).with_limit(window);
    let answers = join_all(connectors.iter().map(|connector| {
        let fetch = &fetch;
        async move { (connector.id().to_string(), connector.search(fetch).await) }
    }))
    .await;

    let mut results = Vec::new();
    let mut databases = Vec::new();
    let mut errors = Vec::new();
    for (database, answer) in answers {
        match answer {
            Ok(hits) => {
                debug!(database = %database, hits = hits.len(), "database answered");
                results.extend(hits);
                databases.push(database);
            }
            Err(error) => {
                warn!(database = %database, kind = %error.kind, error = %error.message, "database search failed");
                errors.push(DatabaseFailure {
                    database,
                    kind: error.kind,
                    message: error.message,
                });
            }
        }
    }
    results.sort_by(newest_first);

    CachedResults {
        results,
        databases,
        errors,
        window,
        stored_at: Utc::now(),
    }
}

/// Orders by publication date descending; undated results sort last.
fn newest_first(a: &SearchResult, b: &SearchResult) -> Ordering {
    match (
        date_sort_key(a.publication_date.as_deref()),
        date_sort_key(b.publication_date.as_deref()),
    ) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn paginate(entry: CachedResults, query: &SearchQuery, cached: bool, stale: bool) -> SearchResponse {
    let total = entry.results.len();
    let limit = query.limit.max(1) as usize;
    let results = entry
        .results
        .into_iter()
        .skip(query.offset())
        .take(limit)
        .collect();
    SearchResponse {
        results,
        total,
        page: query.page,
        total_pages: total.div_ceil(limit),
        databases_searched: entry.databases,
        errors: entry.errors,
        cached,
        stale,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::cache::MemoryCache;
    use crate::search::{ConnectorError, ConnectorErrorKind};

    struct StubConnector {
        id: &'static str,
        hits: Vec<SearchResult>,
        failure: Option<ConnectorErrorKind>,
        enabled: bool,
        allowed: Option<&'static str>,
        max_results: u32,
        gate: Option<Arc<tokio::sync::Notify>>,
        calls: AtomicU32,
    }

    impl StubConnector {
        fn new(id: &'static str, dates: &[Option<&str>]) -> Self {
            let hits = dates
                .iter()
                .enumerate()
                .map(|(i, date)| SearchResult {
                    id: format!("{id}-{i}"),
                    database: id.to_string(),
                    title: format!("{id} {i}"),
                    publication_date: date.map(ToString::to_string),
                    ..SearchResult::default()
                })
                .collect();
            Self {
                id,
                hits,
                failure: None,
                enabled: true,
                allowed: None,
                max_results: u32::MAX,
                gate: None,
                calls: AtomicU32::new(0),
            }
        }

        fn failing(id: &'static str, kind: ConnectorErrorKind) -> Self {
            Self {
                failure: Some(kind),
                ..Self::new(id, &[])
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(AtomicOrdering::SeqCst)
        }
    }

    #[async_trait]
    impl DatabaseConnector for StubConnector {
        fn id(&self) -> &str {
            self.id
        }

        fn name(&self) -> &str {
            self.id
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }

        fn max_results(&self) -> u32 {
            self.max_results
        }

        async fn validate_access(&self, user_id: Option<&str>) -> bool {
            self.allowed.is_none_or(|allowed| user_id == Some(allowed))
        }

        async fn authenticate(&self) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, ConnectorError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(kind) = self.failure {
                return Err(ConnectorError::new(self.id, kind, "stub failure"));
            }
            let window = query.page.saturating_mul(query.limit).min(self.max_results) as usize;
            Ok(self.hits.iter().take(window).cloned().collect())
        }
    }

    fn aggregator(connectors: &[Arc<StubConnector>], cache: Option<SearchCache>) -> SearchAggregator {
        let dyns: Vec<Arc<dyn DatabaseConnector>> = connectors
            .iter()
            .map(|c| Arc::clone(c) as Arc<dyn DatabaseConnector>)
            .collect();
        let aggregator = SearchAggregator::new(dyns, AggregatorSettings::default());
        match cache {
            Some(cache) => aggregator.with_cache(cache),
            None => aggregator,
        }
    }

    #[tokio::test]
    async fn test_results_sorted_newest_first_with_stable_ties() {
        let a = Arc::new(StubConnector::new("a", &[Some("2019"), None, Some("2021-05")]));
        let b = Arc::new(StubConnector::new("b", &[Some("2021-05-01"), Some("2019")]));
        let agg = aggregator(&[a, b], None);

        let response = agg.search(None, &SearchQuery::new("x"), None).await.unwrap();
        let ids: Vec<&str> = response.results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b-0", "a-2", "a-0", "b-1", "a-1"]);
        assert_eq!(response.total, 5);
        assert_eq!(response.databases_searched, vec!["a", "b"]);
        assert!(!response.cached);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_healthy_results() {
        let a = Arc::new(StubConnector::new("a", &[Some("2020")]));
        let b = Arc::new(StubConnector::failing("b", ConnectorErrorKind::Auth));
        let c = Arc::new(StubConnector::new("c", &[Some("2021")]));
        let agg = aggregator(&[a, b.clone(), c], None);

        let response = agg.search(None, &SearchQuery::new("x"), None).await.unwrap();
        assert_eq!(response.results.len(), 2);
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].database, "b");
        assert_eq!(response.errors[0].kind, ConnectorErrorKind::Auth);
        assert_eq!(response.databases_searched, vec!["a", "c"]);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn test_no_databases_available() {
        let mut disabled = StubConnector::new("a", &[]);
        disabled.enabled = false;
        let mut restricted = StubConnector::new("b", &[]);
        restricted.allowed = Some("staff");
        let agg = aggregator(&[Arc::new(disabled), Arc::new(restricted)], None);

        let err = agg.search(Some("guest"), &SearchQuery::new("x"), None).await.unwrap_err();
        assert_eq!(err, SearchError::NoDatabasesAvailable);
        assert!(agg.search(Some("staff"), &SearchQuery::new("x"), None).await.is_ok());

        let filter = vec!["missing".to_string()];
        let err = agg
            .search(Some("staff"), &SearchQuery::new("x"), Some(&filter))
            .await
            .unwrap_err();
        assert_eq!(err, SearchError::NoDatabasesAvailable);
    }

    #[tokio::test]
    async fn test_database_filter_limits_fan_out() {
        let a = Arc::new(StubConnector::new("a", &[Some("2020")]));
        let b = Arc::new(StubConnector::new("b", &[Some("2021")]));
        let agg = aggregator(&[a.clone(), b.clone()], None);

        let filter = vec!["b".to_string()];
        let response = agg.search(None, &SearchQuery::new("x"), Some(&filter)).await.unwrap();
        assert_eq!(response.databases_searched, vec!["b"]);
        assert_eq!(a.calls(), 0);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn test_repeat_query_and_next_page_hit_cache() {
        let dates: Vec<Option<&str>> = vec![Some("2020"); 30];
        let a = Arc::new(StubConnector::new("a", &dates));
        let cache = SearchCache::new(Arc::new(MemoryCache::new()));
        let agg = aggregator(&[a.clone()], Some(cache));

        let query = SearchQuery::new("Rivers").with_limit(10);
        let first = agg.search(None, &query, None).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.total, 30);
        assert_eq!(first.total_pages, 3);
        assert_eq!(a.calls(), 1);

        let again = agg.search(None, &SearchQuery::new("rivers ").with_limit(10), None).await.unwrap();
        assert!(again.cached);
        assert_eq!(again.results, first.results);

        let second = agg.search(None, &query.clone().with_page(2), None).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.page, 2);
        assert_eq!(second.results[0].id, "a-10");
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_page_beyond_cached_window_refetches() {
        let a = Arc::new(StubConnector::new("a", &[Some("2020"); 3]));
        let cache = SearchCache::new(Arc::new(MemoryCache::new()));
        let agg = aggregator(&[a.clone()], Some(cache));

        let query = SearchQuery::new("x").with_limit(1);
        agg.search(None, &query, None).await.unwrap();
        let far = agg.search(None, &query.clone().with_page(6), None).await.unwrap();
        assert!(!far.cached);
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test]
    async fn test_total_failure_is_not_cached() {
        let a = Arc::new(StubConnector::failing("a", ConnectorErrorKind::Network));
        let cache = SearchCache::new(Arc::new(MemoryCache::new()));
        let agg = aggregator(&[a.clone()], Some(cache));

        let response = agg.search(None, &SearchQuery::new("x"), None).await.unwrap();
        assert!(response.results.is_empty());
        assert_eq!(response.errors.len(), 1);
        agg.search(None, &SearchQuery::new("x"), None).await.unwrap();
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test]
    async fn test_stale_entry_served_then_refreshed() {
        let a = Arc::new(StubConnector::new("a", &[Some("2020")]));
        let kv = Arc::new(MemoryCache::new());
        let cache = SearchCache::new(kv).with_serve_stale(true);
        let agg = aggregator(&[a.clone()], Some(cache.clone()));

        let query = SearchQuery::new("x");
        let key = SearchCache::key(&query.validated(DEFAULT_MAX_LIMIT).unwrap(), &["a".to_string()]);
        let old = CachedResults {
            results: Vec::new(),
            databases: vec!["a".to_string()],
            errors: Vec::new(),
            window: 100,
            stored_at: Utc::now() - chrono::Duration::hours(3),
        };
        cache.store(&key, &old).await;

        let response = agg.search(None, &query, None).await.unwrap();
        assert!(response.cached);
        assert!(response.stale);
        assert!(response.results.is_empty());

        for _ in 0..100 {
            if matches!(cache.lookup(&key).await, Some(CacheLookup::Fresh(_))) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let refreshed = agg.search(None, &query, None).await.unwrap();
        assert!(refreshed.cached);
        assert!(!refreshed.stale);
        assert_eq!(refreshed.results.len(), 1);
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_window_is_capped_by_connector_row_limit() {
        let mut capped = StubConnector::new("a", &[Some("2020"); 30]);
        capped.max_results = 12;
        let a = Arc::new(capped);
        let cache = SearchCache::new(Arc::new(MemoryCache::new()));
        let agg = aggregator(&[a.clone()], Some(cache.clone()));

        let query = SearchQuery::new("x").with_limit(5);
        let first = agg.search(None, &query, None).await.unwrap();
        assert_eq!(first.total, 12);

        let key = SearchCache::key(&query.validated(DEFAULT_MAX_LIMIT).unwrap(), &["a".to_string()]);
        let Some(CacheLookup::Fresh(entry)) = cache.lookup(&key).await else {
            panic!("expected a fresh cache entry");
        };
        assert_eq!(entry.window, 12);

        // Page 3 lies past what the connector can return; asking again cannot help.
        let third = agg.search(None, &query.clone().with_page(3), None).await.unwrap();
        assert!(third.cached);
        assert_eq!(third.results.len(), 2);
        assert_eq!(third.results[0].id, "a-10");
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_stale_hits_share_one_refresh() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let mut slow = StubConnector::new("a", &[Some("2020")]);
        slow.gate = Some(Arc::clone(&gate));
        let a = Arc::new(slow);
        let cache = SearchCache::new(Arc::new(MemoryCache::new())).with_serve_stale(true);
        let agg = aggregator(&[a.clone()], Some(cache.clone()));

        let query = SearchQuery::new("x");
        let key = SearchCache::key(&query.validated(DEFAULT_MAX_LIMIT).unwrap(), &["a".to_string()]);
        let old = CachedResults {
            results: Vec::new(),
            databases: vec!["a".to_string()],
            errors: Vec::new(),
            window: 100,
            stored_at: Utc::now() - chrono::Duration::hours(3),
        };
        cache.store(&key, &old).await;

        let (first, second) = tokio::join!(
            agg.search(None, &query, None),
            agg.search(None, &query, None)
        );
        assert!(first.unwrap().stale);
        assert!(second.unwrap().stale);
        let third = agg.search(None, &query, None).await.unwrap();
        assert!(third.stale);

        // Let the refresh reach the connector, then release it.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.calls(), 1);
        gate.notify_one();

        for _ in 0..100 {
            if matches!(cache.lookup(&key).await, Some(CacheLookup::Fresh(_))) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(a.calls(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Once finished, a later stale hit may refresh again.
        cache.store(&key, &old).await;
        let again = agg.search(None, &query, None).await.unwrap();
        assert!(again.stale);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.calls(), 2);
        gate.notify_one();
    }
}
