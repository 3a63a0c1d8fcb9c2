//! Harvest run log types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::StoreError;

/// Status of a harvest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The run is still fetching pages.
    Running,
    /// The endpoint reported no further pages.
    Completed,
    /// Transport failure, store failure, or shutdown ended the run.
    Failed,
}

impl RunStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `Completed` and `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid run status: {s}")),
        }
    }
}

/// Record counters accumulated over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Records examined (parsed, failed, or filtered out).
    pub processed: i64,
    /// Records written for the first time.
    pub added: i64,
    /// Records merged into an existing row.
    pub updated: i64,
    /// Records that could not be parsed.
    pub failed: i64,
}

/// One harvest run log row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarvestRun {
    /// Unique identifier.
    pub id: i64,
    /// Source this run harvested.
    pub source_id: i64,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Run status.
    pub status: RunStatus,
    /// Counters.
    pub counts: RunCounts,
    /// Failure reason for failed runs.
    pub error_message: Option<String>,
}

#[derive(Debug, FromRow)]
pub(crate) struct RunRow {
    id: i64,
    source_id: i64,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    status: String,
    records_processed: i64,
    records_added: i64,
    records_updated: i64,
    records_failed: i64,
    error_message: Option<String>,
}

impl TryFrom<RunRow> for HarvestRun {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e: String| StoreError::invalid_column("status", e))?;
        Ok(Self {
            id: row.id,
            source_id: row.source_id,
            started_at: row.started_at,
            completed_at: row.completed_at,
            status,
            counts: RunCounts {
                processed: row.records_processed,
                added: row.records_added,
                updated: row.records_updated,
                failed: row.records_failed,
            },
            error_message: row.error_message,
        })
    }
}

/// Partial update applied to a running log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunLogPatch {
    /// New status; terminal statuses also stamp `completed_at`.
    pub status: Option<RunStatus>,
    /// Replacement counters.
    pub counts: Option<RunCounts>,
    /// Failure reason.
    pub error_message: Option<String>,
}

impl RunLogPatch {
    /// Incremental progress update.
    #[must_use]
    pub fn progress(counts: RunCounts) -> Self {
        Self {
            counts: Some(counts),
            ..Self::default()
        }
    }

    /// Finalizes the run as completed.
    #[must_use]
    pub fn completed(counts: RunCounts) -> Self {
        Self {
            status: Some(RunStatus::Completed),
            counts: Some(counts),
            error_message: None,
        }
    }

    /// Finalizes the run as failed.
    #[must_use]
    pub fn failed(counts: RunCounts, message: impl Into<String>) -> Self {
        Self {
            status: Some(RunStatus::Failed),
            counts: Some(counts),
            error_message: Some(message.into()),
        }
    }
}

/// A page of run logs, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct RunLogPage {
    /// Runs on this page.
    pub runs: Vec<HarvestRun>,
    /// Total runs for the source.
    pub total: i64,
    /// 1-indexed page number.
    pub page: u32,
    /// Page size.
    pub limit: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_terminal() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_run_status_parse() {
        assert_eq!("completed".parse::<RunStatus>(), Ok(RunStatus::Completed));
        assert!("done".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_run_log_patch_failed_carries_message() {
        let patch = RunLogPatch::failed(RunCounts::default(), "boom");
        assert_eq!(patch.status, Some(RunStatus::Failed));
        assert_eq!(patch.error_message.as_deref(), Some("boom"));
    }
}
