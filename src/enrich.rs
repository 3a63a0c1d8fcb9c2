//! DOI enrichment against the Crossref REST API.
//!
//! [`CrossrefEnricher`] looks a DOI up through a read-through cache keyed
//! `enrich:{doi}`. Successful lookups are cached for at least a week.
//! Enrichment is best-effort: every failure is logged and reported as
//! `None`, never as an error to the harvest run.
//!
//! # Polite Pool
//!
//! Requests carry a `mailto` query parameter to use Crossref's polite pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::cache::{KvCache, get_json, set_json};
use crate::crossref::{CrossrefWorkResponse, DEFAULT_BASE_URL};
use crate::http::{HttpClientError, HttpTimeouts, build_http_client};
use crate::record::RecordFields;

/// Minimum TTL for cached enrichment results (one week).
pub const MIN_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Looks up bibliographic metadata for a DOI.
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Returns partial fields for `doi`, or `None` when unavailable.
    async fn enrich(&self, doi: &str) -> Option<RecordFields>;
}

/// Internal lookup failure; logged, never returned to callers.
#[derive(Debug, Error)]
enum EnrichError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("DOI not found")]
    NotFound,

    #[error("HTTP {0}")]
    Status(u16),

    #[error("unexpected response status '{0}'")]
    ResponseStatus(String),
}

/// Enrichment client configuration.
#[derive(Debug, Clone)]
pub struct EnricherConfig {
    /// API base URL.
    pub base_url: String,
    /// Contact address for the polite pool.
    pub mailto: String,
    /// Cache TTL, raised to [`MIN_CACHE_TTL`] if lower.
    pub cache_ttl: Duration,
    /// HTTP timeouts.
    pub timeouts: HttpTimeouts,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            mailto: String::new(),
            cache_ttl: MIN_CACHE_TTL,
            timeouts: HttpTimeouts::default(),
        }
    }
}

/// Crossref-backed [`Enricher`] with a read-through cache.
pub struct CrossrefEnricher {
    client: Client,
    base_url: String,
    mailto: String,
    cache: Arc<dyn KvCache>,
    cache_ttl: Duration,
}

impl std::fmt::Debug for CrossrefEnricher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossrefEnricher")
            .field("base_url", &self.base_url)
            .field("mailto", &self.mailto)
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

/// Cache key for a DOI.
#[must_use]
pub fn cache_key(doi: &str) -> String {
    format!("enrich:{}", doi.trim().to_ascii_lowercase())
}

impl CrossrefEnricher {
    /// Creates an enricher.
    ///
    /// # Errors
    ///
    /// Returns [`HttpClientError`] if HTTP client construction fails.
    #[instrument(skip_all, fields(base_url = %config.base_url))]
    pub fn new(config: EnricherConfig, cache: Arc<dyn KvCache>) -> Result<Self, HttpClientError> {
        let mailto = config
            .mailto
            .chars()
            .filter(|c| !c.is_control())
            .collect::<String>();
        Ok(Self {
            client: build_http_client("crossref-enrichment", config.timeouts)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            mailto,
            cache,
            cache_ttl: config.cache_ttl.max(MIN_CACHE_TTL),
        })
    }

    async fn fetch(&self, doi: &str) -> Result<RecordFields, EnrichError> {
        let mut url = format!("{}/works/{}", self.base_url, urlencoding::encode(doi));
        if !self.mailto.is_empty() {
            url.push_str("?mailto=");
            url.push_str(&urlencoding::encode(&self.mailto));
        }
        debug!(api_url = %url, "calling Crossref API");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Err(EnrichError::NotFound);
        }
        if !status.is_success() {
            return Err(EnrichError::Status(status.as_u16()));
        }

        let body: CrossrefWorkResponse = response.json().await?;
        if !body.status.eq_ignore_ascii_case("ok") {
            return Err(EnrichError::ResponseStatus(body.status));
        }
        Ok(body.message.to_fields())
    }
}

#[async_trait]
impl Enricher for CrossrefEnricher {
    #[instrument(skip(self), fields(doi = %doi))]
    async fn enrich(&self, doi: &str) -> Option<RecordFields> {
        let key = cache_key(doi);
        if let Some(cached) = get_json::<RecordFields>(self.cache.as_ref(), &key).await {
            debug!("enrichment cache hit");
            return Some(cached);
        }

        match self.fetch(doi).await {
            Ok(fields) => {
                set_json(self.cache.as_ref(), &key, &fields, self.cache_ttl).await;
                Some(fields)
            }
            Err(EnrichError::NotFound) => {
                debug!("DOI unknown to Crossref");
                None
            }
            Err(error) => {
                warn!(error = %error, "enrichment failed; continuing without it");
                None
            }
        }
    }
}
