use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};

use crate::crossref::{CrossrefListResponse, DEFAULT_BASE_URL};
use crate::http::{HttpClientError, build_http_client};
use crate::search::{
    ConnectorConfig, ConnectorError, ConnectorErrorKind, DatabaseConnector, RateLimiter,
    SearchQuery, SearchResult, with_retry,
};

use super::{MAX_REMOTE_ROWS, fetch_json, remote_rows};

const ID: &str = "crossref";

/// Searches Crossref's `/works` index.
///
/// Date bounds go to the API as `from-pub-date`/`until-pub-date`; author
/// and journal filters are applied to the returned page.
#[derive(Debug)]
pub struct CrossrefConnector {
    config: ConnectorConfig,
    client: Client,
    limiter: RateLimiter,
    base_url: String,
}

impl CrossrefConnector {
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
            client: build_http_client("crossref-search", config.timeouts())?,
            limiter: RateLimiter::new(config.rate_limit()),
            base_url,
            config,
        })
    }

    fn search_url(&self, query: &SearchQuery) -> Result<String, ConnectorError> {
        let rows = remote_rows(query.page.saturating_mul(query.limit));
        let mut params: Vec<(&str, String)> = vec![("rows", rows.to_string())];
        if !query.term.is_empty() {
            params.push(("query", query.term.clone()));
        }

        let mut filters = Vec::new();
        if let Some(from) = &query.filters.date_from {
            filters.push(format!("from-pub-date:{from}"));
        }
        if let Some(to) = &query.filters.date_to {
            filters.push(format!("until-pub-date:{to}"));
        }
        if !filters.is_empty() {
            params.push(("filter", filters.join(",")));
        }
        if let Some(mailto) = self.config.mailto.as_deref().filter(|m| !m.is_empty()) {
            params.push(("mailto", mailto.to_string()));
        }

        url::Url::parse_with_params(&format!("{}/works", self.base_url), &params)
            .map(String::from)
            .map_err(|e| ConnectorError::new(ID, ConnectorErrorKind::Unknown, e.to_string()))
    }

    async fn search_once(&self, url: &str, query: &SearchQuery) -> Result<Vec<SearchResult>, ConnectorError> {
        let body: CrossrefListResponse =
            fetch_json(&self.client, &self.limiter, self.config.max_wait(), ID, url).await?;
        if !body.status.eq_ignore_ascii_case("ok") {
            return Err(ConnectorError::new(
                ID,
                ConnectorErrorKind::Parse,
                format!("unexpected response status '{}'", body.status),
            ));
        }
        debug!(
            total = body.message.total_results,
            returned = body.message.items.len(),
            "crossref results"
        );
        Ok(body
            .message
            .items
            .iter()
            .filter_map(|work| {
                let fields = work.to_fields();
                fields.title.as_ref()?;
                let id = fields.doi.clone().or_else(|| fields.url.clone())?;
                Some(SearchResult::from_fields(ID, id, fields))
            })
            .filter(|result| result.matches(&query.filters))
            .collect())
    }
}

#[async_trait]
impl DatabaseConnector for CrossrefConnector {
    fn id(&self) -> &str {
        ID
    }

    fn name(&self) -> &str {
        "Crossref"
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
        Ok(())
    }

    #[instrument(skip(self, query), fields(database = ID, term = %query.term))]
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, ConnectorError> {
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
