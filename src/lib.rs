//! Harvester Core Library
//!
//! This library harvests bibliographic metadata from OAI-PMH repositories
//! into a local store and searches that store alongside external
//! bibliographic databases.
//!
//! # Architecture
//!
//! Harvesting:
//! - [`oai`] - `ListRecords` paging and envelope parsing
//! - [`schema`] - per-format record parsers and provider inference
//! - [`merge`] - record identity and the field merge rule
//! - [`enrich`] - Crossref lookups behind a read-through cache
//! - [`harvest`] - the run controller
//! - [`scheduler`] - cron timers per source
//!
//! Storage:
//! - [`db`] - `SQLite` pool and migrations
//! - [`store`] - sources, run logs, and records behind [`store::HarvestStore`]
//! - [`cache`] - key-value cache with TTL
//!
//! Search:
//! - [`search`] - connectors, result cache, and the aggregator
//!
//! [`service`] ties these together for outer surfaces; [`config`] loads
//! the TOML configuration they are built from.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod crossref;
pub mod db;
pub mod enrich;
pub mod harvest;
pub mod http;
pub mod merge;
pub mod oai;
pub mod record;
pub mod scheduler;
pub mod schema;
pub mod search;
pub mod service;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use cache::{KvCache, MemoryCache};
pub use config::AppConfig;
pub use db::{Database, DatabaseOptions, DbError};
pub use harvest::{HarvestController, HarvestError, HarvestOutcome, HarvestSettings};
pub use oai::{OaiClient, OaiProtocol, ProtocolError};
pub use record::{Author, NormalizedRecord, RecordFields};
pub use scheduler::Scheduler;
pub use search::{SearchAggregator, SearchError, SearchQuery, SearchResponse, SearchResult};
pub use service::{HarvestService, ServiceError};
pub use store::{HarvestStore, Store, StoreError};
