use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::http::{HttpClientError, build_http_client};
use crate::search::{
    ConnectorConfig, ConnectorError, ConnectorErrorKind, DatabaseConnector, RateLimiter,
    SearchQuery, SearchResult, with_retry,
};

use super::{MAX_REMOTE_ROWS, fetch_json, remote_rows};

const ID: &str = "openalex";

/// Default OpenAlex API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.openalex.org";

#[derive(Debug, Deserialize)]
struct WorksResponse {
    #[serde(default)]
    meta: Option<WorksMeta>,
    #[serde(default)]
    results: Vec<Work>,
}

#[derive(Debug, Deserialize)]
struct WorksMeta {
    count: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct Work {
    id: Option<String>,
    doi: Option<String>,
    title: Option<String>,
    display_name: Option<String>,
    publication_date: Option<String>,
    publication_year: Option<i32>,
    #[serde(default)]
    authorships: Vec<Authorship>,
    primary_location: Option<Location>,
    abstract_inverted_index: Option<BTreeMap<String, Vec<usize>>>,
    #[serde(default)]
    keywords: Vec<Named>,
    #[serde(default)]
    concepts: Vec<Named>,
    open_access: Option<OpenAccess>,
    #[serde(rename = "type")]
    work_type: Option<String>,
    cited_by_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Authorship {
    author: Option<Named>,
}

#[derive(Debug, Deserialize)]
struct Named {
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Location {
    landing_page_url: Option<String>,
    source: Option<Named>,
}

#[derive(Debug, Deserialize)]
struct OpenAccess {
    is_oa: Option<bool>,
}

/// Rebuilds abstract text from OpenAlex's word -> positions index.
fn rebuild_abstract(index: &BTreeMap<String, Vec<usize>>) -> Option<String> {
    let mut positioned: Vec<(usize, &str)> = index
        .iter()
        .flat_map(|(word, positions)| positions.iter().map(move |p| (*p, word.as_str())))
        .collect();
    if positioned.is_empty() {
        return None;
    }
    positioned.sort_unstable_by_key(|(position, _)| *position);
    Some(
        positioned
            .into_iter()
            .map(|(_, word)| word)
            .collect::<Vec<_>>()
            .join(" "),
    )
}

impl Work {
    fn into_result(self) -> Option<SearchResult> {
        let title = self.title.or(self.display_name)?;
        let id = self.id?;
        let doi = self.doi.map(|d| {
            d.trim_start_matches("https://doi.org/")
                .to_ascii_lowercase()
        });
        let mut keywords: Vec<String> = self
            .keywords
            .into_iter()
            .chain(self.concepts)
            .filter_map(|k| k.display_name)
            .collect();
        keywords.dedup();

        let mut metadata = Map::new();
        if let Some(work_type) = self.work_type {
            metadata.insert("type".to_string(), Value::String(work_type));
        }
        if let Some(cited_by) = self.cited_by_count {
            metadata.insert("cited_by_count".to_string(), Value::from(cited_by));
        }
        if let Some(is_oa) = self.open_access.and_then(|oa| oa.is_oa) {
            metadata.insert("open_access".to_string(), Value::Bool(is_oa));
        }

        let (url, journal) = match self.primary_location {
            Some(location) => (
                location.landing_page_url,
                location.source.and_then(|s| s.display_name),
            ),
            None => (None, None),
        };

        Some(SearchResult {
            id,
            database: ID.to_string(),
            title,
            authors: self
                .authorships
                .into_iter()
                .filter_map(|a| a.author.and_then(|author| author.display_name))
                .collect(),
            abstract_text: self.abstract_inverted_index.as_ref().and_then(rebuild_abstract),
            journal,
            doi,
            publication_date: self
                .publication_date
                .as_deref()
                .and_then(crate::record::normalize_date)
                .or_else(|| self.publication_year.map(|y| format!("{y:04}"))),
            url,
            keywords,
            metadata,
        })
    }
}

/// Searches the OpenAlex `/works` index.
///
/// All filters are applied to the returned page.
#[derive(Debug)]
pub struct OpenAlexConnector {
    config: ConnectorConfig,
    client: Client,
    limiter: RateLimiter,
    base_url: String,
}

impl OpenAlexConnector {
    /// Creates the connector.
    ///
    /// # Errors
    ///
    /// Returns [`HttpClientError`] if HTTP client construction fails.
    pub fn new(config: ConnectorConfig) -> Result<Self, HttpClientError> {
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            client: build_http_client("openalex-search", config.timeouts())?,
            limiter: RateLimiter::new(config.rate_limit()),
            base_url,
            config,
        })
    }

    fn search_url(&self, query: &SearchQuery) -> Result<String, ConnectorError> {
        let rows = remote_rows(query.page.saturating_mul(query.limit));
        let mut params: Vec<(&str, String)> = vec![("per-page", rows.to_string())];
        if !query.term.is_empty() {
            params.push(("search", query.term.clone()));
        }
        if let Some(mailto) = self.config.mailto.as_deref().filter(|m| !m.is_empty()) {
            params.push(("mailto", mailto.to_string()));
        }
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            params.push(("api_key", key.to_string()));
        }

        url::Url::parse_with_params(&format!("{}/works", self.base_url), &params)
            .map(String::from)
            .map_err(|e| ConnectorError::new(ID, ConnectorErrorKind::Unknown, e.to_string()))
    }

    async fn search_once(&self, url: &str, query: &SearchQuery) -> Result<Vec<SearchResult>, ConnectorError> {
        let body: WorksResponse =
            fetch_json(&self.client, &self.limiter, self.config.max_wait(), ID, url).await?;
        debug!(
            total = body.meta.and_then(|m| m.count),
            returned = body.results.len(),
            "openalex results"
        );
        Ok(body
            .results
            .into_iter()
            .filter_map(Work::into_result)
            .filter(|result| result.matches(&query.filters))
            .collect())
    }
}

#[async_trait]
impl DatabaseConnector for OpenAlexConnector {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        "OpenAlex"
    }

    fn max_results(&self) -> u32 {
        MAX_REMOTE_ROWS
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    async fn validate_access(&self, user_id: Option<&str>) -> bool {
        self.config.allows(user_id)
    }

    async fn authenticate(&self) -> Result<(), ConnectorError> {
        match self.config.api_key.as_deref() {
            Some(key) if key.trim().is_empty() => Err(ConnectorError::new(
                ID,
                ConnectorErrorKind::Auth,
                "api_key is configured but empty",
            )),
            _ => Ok(()),
        }
    }

    #[instrument(skip(self, query), fields(database = ID, term = %query.term))]
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, ConnectorError> {
        self.authenticate().await?;
        let url = self.search_url(query)?;
        with_retry(
            self.config.max_retries,
            self.config.backoff(),
            self.config.max_wait(),
            || self.search_once(&url, query),
        )
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, ResponseTemplate};

    fn works_json() -> Value {
        serde_json::json!({
            "meta": {"count": 1},
            "results": [{
                "id": "https://openalex.org/W1",
                "doi": "https://doi.org/10.1000/XYZ",
                "title": "Harbor Cities",
                "publication_date": "2020-05-01",
                "authorships": [{"author": {"display_name": "Jane Doe"}}],
                "primary_location": {
                    "landing_page_url": "https://example.org/w1",
                    "source": {"display_name": "Urban History"}
                },
                "abstract_inverted_index": {"cities": [1], "Harbor": [0], "grew.": [2]},
                "concepts": [{"display_name": "History"}],
                "open_access": {"is_oa": true},
                "type": "article"
            }]
        })
    }

    #[test]
    fn test_rebuild_abstract_orders_by_position() {
        let mut index = BTreeMap::new();
        index.insert("world".to_string(), vec![1]);
        index.insert("hello".to_string(), vec![0, 2]);
        assert_eq!(rebuild_abstract(&index).as_deref(), Some("hello world hello"));
        assert_eq!(rebuild_abstract(&BTreeMap::new()), None);
    }

    #[tokio::test]
    async fn test_search_maps_work() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(path("/works"))
            .and(query_param("search", "harbor"))
            .and(query_param("per-page", "20"))
            .respond_with(ResponseTemplate::new(200).set_body_json(works_json()))
            .mount(&mock_server)
            .await;

        let connector = OpenAlexConnector::new(ConnectorConfig {
            base_url: Some(mock_server.uri()),
            rate_limit_ms: 0,
            ..ConnectorConfig::default()
        })
        .unwrap();
        let results = connector.search(&SearchQuery::new("harbor")).await.unwrap();

        assert_eq!(results.len(), 1);
        let hit = &results[0];
        assert_eq!(hit.doi.as_deref(), Some("10.1000/xyz"));
        assert_eq!(hit.journal.as_deref(), Some("Urban History"));
        assert_eq!(hit.abstract_text.as_deref(), Some("Harbor cities grew."));
        assert_eq!(hit.keywords, vec!["History"]);
        assert_eq!(hit.metadata["open_access"], true);
    }

    #[tokio::test]
    async fn test_empty_api_key_fails_authentication() {
        let connector = OpenAlexConnector::new(ConnectorConfig {
            api_key: Some(" ".to_string()),
            ..ConnectorConfig::default()
        })
        .unwrap();
        let err = connector.search(&SearchQuery::new("x")).await.unwrap_err();
        assert_eq!(err.kind, ConnectorErrorKind::Auth);
    }
}
