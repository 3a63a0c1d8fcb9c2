//! Federated search across external databases and the local index.
//!
//! # Overview
//!
//! - [`DatabaseConnector`] - one external system behind a common contract
//! - [`with_retry`] - exponential backoff for retryable connector errors
//! - [`SearchCache`] - first-page result sets keyed by a query digest
//! - [`SearchAggregator`] - fan-out, merge, sort, paginate
//!
//! A failing connector only removes its own contribution: the aggregated
//! response carries its error next to the results of the healthy ones.

mod aggregator;
mod cache;
mod connector;
pub mod connectors;
mod rate_limiter;

pub use aggregator::{AggregatorSettings, DEFAULT_WINDOW_PAGES, SearchAggregator};
pub use cache::{CacheLookup, CachedResults, DEFAULT_SEARCH_TTL, SearchCache};
pub use connector::{
    ConnectorConfig, ConnectorError, ConnectorErrorKind, DatabaseConnector, with_retry,
};
pub use rate_limiter::{RateLimiter, extract_host, parse_retry_after};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::record::RecordFields;

/// Default page size.
pub const DEFAULT_LIMIT: u32 = 20;

/// Default hard cap on the page size.
pub const DEFAULT_MAX_LIMIT: u32 = 100;

/// Errors that fail a whole search call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SearchError {
    /// No enabled connector is authorized for the caller and filter.
    #[error("no databases available for this search\n  Suggestion: Check that at least one connector is enabled and the database filter names it")]
    NoDatabasesAvailable,

    /// The query cannot be run.
    #[error("invalid search query: {0}")]
    InvalidQuery(String),
}

/// Structured search filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Inclusive lower date bound, `YYYY[-MM[-DD]]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<String>,
    /// Inclusive upper date bound, `YYYY[-MM[-DD]]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<String>,
    /// Any-of author name fragments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    /// Any-of journal titles.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub journals: Vec<String>,
}

impl SearchFilters {
    /// Returns true when no filter is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.date_from.is_none()
            && self.date_to.is_none()
            && self.authors.is_empty()
            && self.journals.is_empty()
    }
}

/// A federated search request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Free-text term.
    pub term: String,
    /// Structured filters.
    #[serde(default)]
    pub filters: SearchFilters,
    /// 1-indexed page.
    pub page: u32,
    /// Results per page.
    pub limit: u32,
}

impl SearchQuery {
    /// First page of `term` with the default page size.
    #[must_use]
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            filters: SearchFilters::default(),
            page: 1,
            limit: DEFAULT_LIMIT,
        }
    }

    /// Returns a copy for `page`.
    #[must_use]
    pub fn with_page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    /// Returns a copy with `limit` results per page.
    #[must_use]
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Validates and normalizes the query: trims text, drops blank filter
    /// entries, raises `page` to 1, and clamps `limit` to `1..=max_limit`.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::InvalidQuery`] when both term and filters are
    /// empty, or a date bound is not `YYYY[-MM[-DD]]`.
    pub fn validated(&self, max_limit: u32) -> Result<Self, SearchError> {
        let clean = |values: &[String]| -> Vec<String> {
            values
                .iter()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect()
        };
        let date = |value: &Option<String>| -> Result<Option<String>, SearchError> {
            match value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                None => Ok(None),
                Some(raw) => crate::record::normalize_date(raw)
                    .filter(|d| d == raw)
                    .map(Some)
                    .ok_or_else(|| SearchError::InvalidQuery(format!("invalid date bound '{raw}'"))),
            }
        };

        let query = Self {
            term: self.term.trim().to_string(),
            filters: SearchFilters {
                date_from: date(&self.filters.date_from)?,
                date_to: date(&self.filters.date_to)?,
                authors: clean(&self.filters.authors),
                journals: clean(&self.filters.journals),
            },
            page: self.page.max(1),
            limit: self.limit.clamp(1, max_limit.max(1)),
        };
        if query.term.is_empty() && query.filters.is_empty() {
            return Err(SearchError::InvalidQuery(
                "a search term or at least one filter is required".to_string(),
            ));
        }
        Ok(query)
    }

    /// Cache identity: lowercased term and filters with `page` fixed to 1.
    #[must_use]
    pub fn cache_form(&self) -> Self {
        let lower = |values: &[String]| -> Vec<String> {
            let mut out: Vec<String> = values.iter().map(|v| v.trim().to_lowercase()).collect();
            out.sort();
            out.dedup();
            out
        };
        Self {
            term: self.term.trim().to_lowercase(),
            filters: SearchFilters {
                date_from: self.filters.date_from.clone(),
                date_to: self.filters.date_to.clone(),
                authors: lower(&self.filters.authors),
                journals: lower(&self.filters.journals),
            },
            page: 1,
            limit: self.limit,
        }
    }

    /// Index of the first result on this page.
    #[must_use]
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize).saturating_mul(self.limit as usize)
    }
}

/// One normalized hit, shared by every connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Connector-scoped id.
    pub id: String,
    /// Id of the connector that produced the hit.
    pub database: String,
    /// Title.
    pub title: String,
    /// Author display names.
    #[serde(default)]
    pub authors: Vec<String>,
    /// Abstract.
    #[serde(default, rename = "abstract", skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    /// Journal or venue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<String>,
    /// DOI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    /// Publication date, `YYYY[-MM[-DD]]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_date: Option<String>,
    /// Landing page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Keywords or subjects.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Source-specific extras.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl SearchResult {
    /// Builds a result from normalized record fields.
    ///
    /// `extra` metadata and the open-access flag land in `metadata`.
    #[must_use]
    pub fn from_fields(database: &str, id: String, fields: RecordFields) -> Self {
        let mut metadata = fields.extra;
        if let Some(open_access) = fields.open_access {
            metadata.insert("open_access".to_string(), Value::Bool(open_access));
        }
        Self {
            id,
            database: database.to_string(),
            title: fields.title.unwrap_or_default(),
            authors: fields.authors.into_iter().map(|a| a.name).collect(),
            abstract_text: fields.abstract_text,
            journal: fields.journal,
            doi: fields.doi,
            publication_date: fields.publication_date,
            url: fields.url,
            keywords: fields.keywords,
            metadata,
        }
    }

    /// Whether the result satisfies `filters`.
    ///
    /// Dates compare on the bound's precision; a result without a date fails
    /// any date bound. Authors match by case-insensitive substring, journals
    /// by case-insensitive equality.
    #[must_use]
    pub fn matches(&self, filters: &SearchFilters) -> bool {
        let date = self.publication_date.as_deref();
        let prefix = |bound: &str| date.map(|d| d.get(..bound.len()).unwrap_or(d));
        if let Some(from) = filters.date_from.as_deref()
            && prefix(from).is_none_or(|d| d < from)
        {
            return false;
        }
        if let Some(to) = filters.date_to.as_deref()
            && prefix(to).is_none_or(|d| d > to)
        {
            return false;
        }

        let authors_ok = filters.authors.is_empty()
            || filters.authors.iter().any(|wanted| {
                let wanted = wanted.to_lowercase();
                self.authors.iter().any(|a| a.to_lowercase().contains(&wanted))
            });
        let journals_ok = filters.journals.is_empty()
            || self.journal.as_deref().is_some_and(|journal| {
                filters
                    .journals
                    .iter()
                    .any(|wanted| wanted.eq_ignore_ascii_case(journal))
            });
        authors_ok && journals_ok
    }
}

/// A connector failure reported alongside partial results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseFailure {
    /// Connector id.
    pub database: String,
    /// Error category.
    pub kind: ConnectorErrorKind,
    /// Error message.
    pub message: String,
}

/// Aggregated, paginated search response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResponse {
    /// Results on the requested page.
    pub results: Vec<SearchResult>,
    /// Size of the merged result set.
    pub total: usize,
    /// Requested page.
    pub page: u32,
    /// Number of pages at the requested limit.
    pub total_pages: usize,
    /// Connectors that contributed (or were served from cache).
    pub databases_searched: Vec<String>,
    /// Per-connector failures.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<DatabaseFailure>,
    /// True when served from the search cache.
    pub cached: bool,
    /// True when the cached entry was past its TTL.
    pub stale: bool,
}
