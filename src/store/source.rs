//! Harvest source types and status definitions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::StoreError;

/// Lifecycle status of a harvest source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    /// Idle and eligible for scheduled harvests.
    Active,
    /// A harvest run is in progress.
    Harvesting,
    /// The last run failed; the next scheduled tick retries.
    Error,
    /// Operator paused the source; no scheduled harvests.
    Paused,
}

impl SourceStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Harvesting => "harvesting",
            Self::Error => "error",
            Self::Paused => "paused",
        }
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SourceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "harvesting" => Ok(Self::Harvesting),
            "error" => Ok(Self::Error),
            "paused" => Ok(Self::Paused),
            _ => Err(format!("invalid source status: {s}")),
        }
    }
}

/// A registered OAI-PMH endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarvestSource {
    /// Unique identifier.
    pub id: i64,
    /// Operator-facing name.
    pub name: String,
    /// Base URL of the OAI-PMH endpoint.
    pub endpoint_url: String,
    /// Metadata schema requested from the endpoint (`oai_dc`, `marc21`, ...).
    pub metadata_prefix: String,
    /// Optional OAI set restricting the harvest.
    pub set_spec: Option<String>,
    /// Providers admitted into the store; empty admits all.
    pub provider_allow_list: Vec<String>,
    /// Cron recurrence expression.
    pub schedule: String,
    /// Institution owning this source, used for provider listings.
    pub institution_id: Option<String>,
    /// Continuation token of the last completed page of an unfinished harvest.
    pub resumption_token: Option<String>,
    /// When the last harvest completed successfully.
    pub last_harvested_at: Option<DateTime<Utc>>,
    /// Current lifecycle status.
    pub status: SourceStatus,
    /// Creation timestamp.
    pub created_at: String,
}

impl HarvestSource {
    /// Returns true when `provider` passes this source's allow-list.
    #[must_use]
    pub fn admits_provider(&self, provider: &str) -> bool {
        self.provider_allow_list.is_empty()
            || self
                .provider_allow_list
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(provider))
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct SourceRow {
    id: i64,
    name: String,
    endpoint_url: String,
    metadata_prefix: String,
    set_spec: Option<String>,
    provider_allow_list: String,
    schedule: String,
    institution_id: Option<String>,
    resumption_token: Option<String>,
    last_harvested_at: Option<DateTime<Utc>>,
    status: String,
    created_at: String,
}

impl TryFrom<SourceRow> for HarvestSource {
    type Error = StoreError;

    fn try_from(row: SourceRow) -> Result<Self, Self::Error> {
        let provider_allow_list: Vec<String> = serde_json::from_str(&row.provider_allow_list)
            .map_err(|e| StoreError::invalid_column("provider_allow_list", e))?;
        let status = row
            .status
            .parse()
            .map_err(|e: String| StoreError::invalid_column("status", e))?;

        Ok(Self {
            id: row.id,
            name: row.name,
            endpoint_url: row.endpoint_url,
            metadata_prefix: row.metadata_prefix,
            set_spec: row.set_spec,
            provider_allow_list,
            schedule: row.schedule,
            institution_id: row.institution_id,
            resumption_token: row.resumption_token,
            last_harvested_at: row.last_harvested_at,
            status,
            created_at: row.created_at,
        })
    }
}

/// Fields an operator supplies when registering a source.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewHarvestSource {
    /// Operator-facing name.
    pub name: String,
    /// Base URL of the OAI-PMH endpoint.
    pub endpoint_url: String,
    /// Metadata schema identifier.
    pub metadata_prefix: String,
    /// Optional OAI set.
    pub set_spec: Option<String>,
    /// Provider allow-list.
    #[serde(default)]
    pub provider_allow_list: Vec<String>,
    /// Cron recurrence expression.
    pub schedule: String,
    /// Owning institution.
    pub institution_id: Option<String>,
}

/// Partial update applied to a source's harvest state.
///
/// `None` leaves a column untouched; `resumption_token: Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceStatePatch {
    /// New lifecycle status.
    pub status: Option<SourceStatus>,
    /// New continuation token, or `Some(None)` to clear it.
    pub resumption_token: Option<Option<String>>,
    /// New last-successful-harvest timestamp.
    pub last_harvested_at: Option<DateTime<Utc>>,
}

impl SourceStatePatch {
    /// Patch that only changes the status.
    #[must_use]
    pub fn status(status: SourceStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Patch that only changes the continuation token.
    #[must_use]
    pub fn token(token: Option<String>) -> Self {
        Self {
            resumption_token: Some(token),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(allow: &[&str]) -> HarvestSource {
        HarvestSource {
            id: 1,
            name: "test".to_string(),
            endpoint_url: "https://example.org/oai".to_string(),
            metadata_prefix: "oai_dc".to_string(),
            set_spec: None,
            provider_allow_list: allow.iter().map(ToString::to_string).collect(),
            schedule: "0 0 * * *".to_string(),
            institution_id: None,
            resumption_token: None,
            last_harvested_at: None,
            status: SourceStatus::Active,
            created_at: String::new(),
        }
    }

    #[test]
    fn test_source_status_round_trips_through_str() {
        for status in [
            SourceStatus::Active,
            SourceStatus::Harvesting,
            SourceStatus::Error,
            SourceStatus::Paused,
        ] {
            assert_eq!(status.as_str().parse::<SourceStatus>(), Ok(status));
        }
        assert!("deleted".parse::<SourceStatus>().is_err());
    }

    #[test]
    fn test_admits_provider_empty_list_admits_all() {
        assert!(source(&[]).admits_provider("anything"));
    }

    #[test]
    fn test_admits_provider_case_insensitive() {
        let s = source(&["jstor"]);
        assert!(s.admits_provider("JSTOR"));
        assert!(!s.admits_provider("proquest"));
    }
}
