//! Harvest run controller.
//!
//! [`HarvestController::run`] drives one source through
//! `Idle -> Running -> {Completed | Failed}`: it fetches `ListRecords` pages
//! strictly in order, parses and enriches each page's records with bounded
//! concurrency, upserts them in bounded transactional batches, and persists
//! the continuation token after every page so an interrupted run resumes
//! from the last completed page.
//!
//! At most one run per source is in flight; a second request for the same
//! source fails with [`HarvestError::AlreadyRunning`].

mod controller;
mod retry;

pub use controller::{HarvestController, SHUTDOWN_REASON};
pub use retry::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY, FailureType, RetryDecision,
    RetryPolicy, classify_error,
};

use thiserror::Error;

use crate::store::{RunCounts, RunStatus, StoreError};

/// Default number of records parsed and enriched concurrently per page.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default number of records per upsert transaction.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Errors that prevent a run from starting or from being recorded.
///
/// Failures *inside* a run (transport, envelope, store write) do not surface
/// here; they finalize the run log as failed and are reported through
/// [`HarvestOutcome`].
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Another run for the same source is in progress.
    #[error("source {source_id} is already being harvested; skipping")]
    AlreadyRunning {
        /// Source id
        source_id: i64,
    },

    /// The source id is unknown.
    #[error("harvest source {source_id} not found\n  Suggestion: Run `harvester source list` to see registered sources")]
    SourceNotFound {
        /// Source id
        source_id: i64,
    },

    /// The source is paused by an operator.
    #[error("harvest source {source_id} is paused\n  Suggestion: Run `harvester source resume {source_id}` first")]
    SourcePaused {
        /// Source id
        source_id: i64,
    },

    /// The store failed while starting or finalizing the run.
    #[error("store error during harvest: {0}")]
    Store(#[from] StoreError),
}

/// Tuning for the harvest controller.
#[derive(Debug, Clone)]
pub struct HarvestSettings {
    /// Records parsed and enriched concurrently within one page.
    pub worker_count: usize,
    /// Records per upsert transaction.
    pub batch_size: usize,
    /// Page fetch retry policy.
    pub retry: RetryPolicy,
}

impl Default for HarvestSettings {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of one finalized run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestOutcome {
    /// Source id.
    pub source_id: i64,
    /// Run log id.
    pub run_id: i64,
    /// Terminal status written to the run log.
    pub status: RunStatus,
    /// Final counters.
    pub counts: RunCounts,
    /// Pages fetched successfully.
    pub pages: u32,
    /// Error message written to the run log, if the run failed.
    pub error_message: Option<String>,
}

impl HarvestOutcome {
    /// Returns true when the run completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}
