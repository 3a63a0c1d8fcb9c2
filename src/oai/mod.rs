//! OAI-PMH protocol client.
//!
//! Fetches one `ListRecords` page at a time. The client never retries on
//! its own: once a continuation token has advanced, only the caller knows
//! whether re-requesting is safe, so retry policy lives in the harvest
//! controller.
//!
//! # Example
//!
//! ```no_run
//! use harvester_core::oai::{ListRequest, OaiClient, OaiProtocol};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = OaiClient::new(Default::default())?;
//! let page = client
//!     .list_page("https://example.org/oai", &ListRequest::new("oai_dc"))
//!     .await?;
//! println!("{} records, more: {}", page.records.len(), page.resumption_token.is_some());
//! # Ok(())
//! # }
//! ```

mod client;
mod envelope;
mod error;
pub mod xml;

pub use client::OaiClient;
pub use envelope::decode_list_records;
pub use error::ProtocolError;

use async_trait::async_trait;
use serde_json::Value;

/// Selector for one `ListRecords` request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    /// Metadata schema, e.g. `oai_dc`.
    pub metadata_prefix: String,
    /// Optional set restriction.
    pub set: Option<String>,
    /// Lower datestamp bound (inclusive), `YYYY-MM-DD`.
    pub from: Option<String>,
    /// Upper datestamp bound (inclusive), `YYYY-MM-DD`.
    pub until: Option<String>,
    /// Continuation token from the previous page.
    pub resumption_token: Option<String>,
}

impl ListRequest {
    /// Creates a first-page request for the given metadata prefix.
    #[must_use]
    pub fn new(metadata_prefix: impl Into<String>) -> Self {
        Self {
            metadata_prefix: metadata_prefix.into(),
            ..Self::default()
        }
    }

    /// Returns a request that continues from `token`.
    #[must_use]
    pub fn continue_with(&self, token: impl Into<String>) -> Self {
        Self {
            resumption_token: Some(token.into()),
            ..self.clone()
        }
    }

    /// Query parameters for this request.
    ///
    /// A resumption token is exclusive: every other selector is omitted.
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("verb", "ListRecords".to_string())];
        if let Some(token) = &self.resumption_token {
            pairs.push(("resumptionToken", token.clone()));
            return pairs;
        }
        pairs.push(("metadataPrefix", self.metadata_prefix.clone()));
        if let Some(set) = &self.set {
            pairs.push(("set", set.clone()));
        }
        if let Some(from) = &self.from {
            pairs.push(("from", from.clone()));
        }
        if let Some(until) = &self.until {
            pairs.push(("until", until.clone()));
        }
        pairs
    }
}

/// Record header as reported by the endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordHeader {
    /// Source-native identifier, e.g. `oai:example.org:123`.
    pub identifier: String,
    /// Last-modified datestamp.
    pub datestamp: Option<String>,
    /// `deleted` for tombstones.
    pub status: Option<String>,
    /// Sets the record belongs to.
    pub set_specs: Vec<String>,
}

impl RecordHeader {
    /// Returns true for a deletion tombstone.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.status.as_deref() == Some("deleted")
    }
}

/// One record as fetched, before schema parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// Header fields.
    pub header: RecordHeader,
    /// Metadata payload converted to JSON; absent for deleted records.
    pub metadata: Option<Value>,
}

/// One fetched page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
    /// Records on this page.
    pub records: Vec<RawRecord>,
    /// Token for the next page; `None` on the last page.
    pub resumption_token: Option<String>,
    /// Total list size when the endpoint reports it.
    pub complete_list_size: Option<u64>,
}

/// Fetches `ListRecords` pages from an endpoint.
#[async_trait]
pub trait OaiProtocol: Send + Sync {
    /// Fetches one page.
    async fn list_page(&self, endpoint: &str, request: &ListRequest) -> Result<ListPage, ProtocolError>;
}
