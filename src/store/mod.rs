//! Persistent store for harvest sources, run logs, and normalized records.
//!
//! This module provides `SQLite`-backed persistence behind the
//! [`HarvestStore`] trait so the harvest controller, scheduler, and local
//! search connector depend on an abstract data-access boundary.
//!
//! # Overview
//!
//! - [`Store`] - `SQLite` implementation over a [`Database`]
//! - [`HarvestSource`] / [`SourceStatus`] - registered endpoints
//! - [`HarvestRun`] / [`RunStatus`] - per-run logs, immutable once finalized
//! - [`StoredRecord`] - normalized records with row bookkeeping
//!
//! Record batches are upserted inside one transaction per batch: a failure
//! anywhere in the batch rolls back the whole batch and leaves earlier
//! batches committed.
//!
//! # Example
//!
//! ```ignore
//! use harvester_core::store::{NewHarvestSource, Store};
//! use harvester_core::Database;
//!
//! let store = Store::new(Database::new_in_memory().await?);
//! let id = store
//!     .create_source(&NewHarvestSource {
//!         name: "Example".into(),
//!         endpoint_url: "https://example.org/oai".into(),
//!         metadata_prefix: "oai_dc".into(),
//!         schedule: "0 3 * * *".into(),
//!         ..NewHarvestSource::default()
//!     })
//!     .await?;
//! ```

mod error;
mod records;
mod run_log;
mod source;

pub use error::{StoreDbErrorKind, StoreError};
pub use records::{ProviderSummary, StoredRecord};
pub use run_log::{HarvestRun, RunCounts, RunLogPage, RunLogPatch, RunStatus};
pub use source::{HarvestSource, NewHarvestSource, SourceStatePatch, SourceStatus};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::merge::{IdentityKey, UpsertAction};
use crate::record::NormalizedRecord;
use crate::search::SearchQuery;

use run_log::RunRow;
use source::SourceRow;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Data-access contract consumed by the harvesting and search components.
#[async_trait]
pub trait HarvestStore: Send + Sync {
    /// Loads one source.
    async fn get_source(&self, id: i64) -> Result<Option<HarvestSource>>;

    /// Lists sources eligible for scheduling (every status except `paused`).
    async fn list_active_sources(&self) -> Result<Vec<HarvestSource>>;

    /// Upserts a batch of records in one transaction, returning one action per record.
    async fn batch_upsert_records(&self, records: &[NormalizedRecord])
    -> Result<Vec<UpsertAction>>;

    /// Marks records reported deleted by the endpoint inactive.
    async fn mark_records_deleted(&self, source_id: i64, record_ids: &[String]) -> Result<u64>;

    /// Opens a run log in `running` status.
    async fn create_run_log(&self, source_id: i64, started_at: DateTime<Utc>) -> Result<i64>;

    /// Applies a patch to a running log.
    async fn update_run_log(&self, id: i64, patch: &RunLogPatch) -> Result<()>;

    /// Applies a patch to a source's harvest state.
    async fn update_source_state(&self, id: i64, patch: &SourceStatePatch) -> Result<()>;

    /// Runs a search over active stored records.
    async fn search_records(&self, query: &SearchQuery, limit: u32) -> Result<Vec<StoredRecord>>;
}

/// `SQLite`-backed store.
#[derive(Debug, Clone)]
pub struct Store {
    db: Database,
}

/// Returns `Ok(())` if at least one row was affected; otherwise `missing`.
fn check_affected(rows_affected: u64, missing: StoreError) -> Result<()> {
    if rows_affected == 0 {
        Err(missing)
    } else {
        Ok(())
    }
}

impl Store {
    /// Creates a store over the given database connection.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the underlying database.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Registers a new harvest source in `active` status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the insert fails.
    #[instrument(skip(self, source), fields(name = %source.name, endpoint = %source.endpoint_url))]
    pub async fn create_source(&self, source: &NewHarvestSource) -> Result<i64> {
        let allow_list = serde_json::to_string(&source.provider_allow_list)
            .map_err(|e| StoreError::invalid_column("provider_allow_list", e))?;
        let row = sqlx::query(
            r"INSERT INTO harvest_sources (
                name, endpoint_url, metadata_prefix, set_spec, provider_allow_list,
                schedule, institution_id, status
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(&source.name)
        .bind(&source.endpoint_url)
        .bind(&source.metadata_prefix)
        .bind(source.set_spec.as_deref())
        .bind(allow_list)
        .bind(&source.schedule)
        .bind(source.institution_id.as_deref())
        .bind(SourceStatus::Active.as_str())
        .fetch_one(self.db.pool())
        .await?;

        Ok(row.get("id"))
    }

    /// Lists every source, including paused ones.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or a row is malformed.
    #[instrument(skip(self))]
    pub async fn list_sources(&self) -> Result<Vec<HarvestSource>> {
        sqlx::query_as::<_, SourceRow>("SELECT * FROM harvest_sources ORDER BY id")
            .fetch_all(self.db.pool())
            .await?
            .into_iter()
            .map(HarvestSource::try_from)
            .collect()
    }

    /// Deletes a source. Its records stay, detached from the source.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SourceNotFound`] if no source has this id.
    #[instrument(skip(self))]
    pub async fn delete_source(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM harvest_sources WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        check_affected(result.rows_affected(), StoreError::SourceNotFound(id))
    }

    /// Loads one run log.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_run_log(&self, id: i64) -> Result<Option<HarvestRun>> {
        sqlx::query_as::<_, RunRow>("SELECT * FROM harvest_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .map(HarvestRun::try_from)
            .transpose()
    }

    /// Lists a source's run logs, newest first.
    ///
    /// `page` is 1-indexed; `limit` is clamped to at least 1.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_run_logs(&self, source_id: i64, page: u32, limit: u32) -> Result<RunLogPage> {
        let page = page.max(1);
        let limit = limit.max(1);
        let offset = i64::from(page - 1) * i64::from(limit);

        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM harvest_runs WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(self.db.pool())
            .await?;

        let runs = sqlx::query_as::<_, RunRow>(
            r"SELECT * FROM harvest_runs
              WHERE source_id = ?
              ORDER BY started_at DESC, id DESC
              LIMIT ? OFFSET ?",
        )
        .bind(source_id)
        .bind(i64::from(limit))
        .bind(offset)
        .fetch_all(self.db.pool())
        .await?
        .into_iter()
        .map(HarvestRun::try_from)
        .collect::<Result<Vec<_>>>()?;

        Ok(RunLogPage {
            runs,
            total: total.0,
            page,
            limit,
        })
    }

    /// Looks up a stored record by identity key.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    #[instrument(skip(self), fields(identity = %key))]
    pub async fn find_record(&self, key: &IdentityKey) -> Result<Option<StoredRecord>> {
        let mut conn = self.db.pool().acquire().await?;
        let probe = match key {
            IdentityKey::Doi { provider, doi } => {
                let mut r = NormalizedRecord::new(provider.as_str(), "");
                r.fields.doi = Some(doi.clone());
                r
            }
            IdentityKey::RecordId {
                provider,
                record_id,
            } => NormalizedRecord::new(provider.as_str(), record_id.as_str()),
        };
        records::resolve_identity(&mut conn, &probe).await
    }

    /// Counts stored records, optionally only active ones.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn count_records(&self, active_only: bool) -> Result<i64> {
        let sql = if active_only {
            "SELECT COUNT(*) FROM records WHERE active = 1"
        } else {
            "SELECT COUNT(*) FROM records"
        };
        let count: (i64,) = sqlx::query_as(sql).fetch_one(self.db.pool()).await?;
        Ok(count.0)
    }

    /// Lists distinct providers with active record counts.
    ///
    /// With `institution_id`, only records harvested by that institution's
    /// sources are counted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_providers(&self, institution_id: Option<&str>) -> Result<Vec<ProviderSummary>> {
        let providers = sqlx::query_as::<_, ProviderSummary>(
            r"SELECT r.provider AS provider, COUNT(*) AS record_count
              FROM records r
              LEFT JOIN harvest_sources s ON s.id = r.source_id
              WHERE r.active = 1 AND (? IS NULL OR s.institution_id = ?)
              GROUP BY r.provider
              ORDER BY r.provider",
        )
        .bind(institution_id)
        .bind(institution_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(providers)
    }
}

#[async_trait]
impl HarvestStore for Store {
    #[instrument(skip(self))]
    async fn get_source(&self, id: i64) -> Result<Option<HarvestSource>> {
        sqlx::query_as::<_, SourceRow>("SELECT * FROM harvest_sources WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .map(HarvestSource::try_from)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn list_active_sources(&self) -> Result<Vec<HarvestSource>> {
        sqlx::query_as::<_, SourceRow>(
            "SELECT * FROM harvest_sources WHERE status != ? ORDER BY id",
        )
        .bind(SourceStatus::Paused.as_str())
        .fetch_all(self.db.pool())
        .await?
        .into_iter()
        .map(HarvestSource::try_from)
        .collect()
    }

    #[instrument(skip(self, records), fields(batch = records.len()))]
    async fn batch_upsert_records(
        &self,
        records: &[NormalizedRecord],
    ) -> Result<Vec<UpsertAction>> {
        let mut tx = self.db.pool().begin().await?;
        let mut actions = Vec::with_capacity(records.len());
        for record in records {
            // Dropping `tx` on error rolls the whole batch back.
            actions.push(records::upsert_one(&mut tx, record).await?);
        }
        tx.commit().await?;
        debug!(upserted = actions.len(), "committed record batch");
        Ok(actions)
    }

    #[instrument(skip(self, record_ids), fields(count = record_ids.len()))]
    async fn mark_records_deleted(&self, source_id: i64, record_ids: &[String]) -> Result<u64> {
        let mut tx = self.db.pool().begin().await?;
        let mut affected = 0;
        for record_id in record_ids {
            let result = sqlx::query(
                r"UPDATE records
                  SET active = 0, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                  WHERE source_id = ? AND record_id = ?",
            )
            .bind(source_id)
            .bind(record_id)
            .execute(&mut *tx)
            .await?;
            affected += result.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }

    #[instrument(skip(self))]
    async fn create_run_log(&self, source_id: i64, started_at: DateTime<Utc>) -> Result<i64> {
        let row = sqlx::query(
            r"INSERT INTO harvest_runs (source_id, started_at, status)
              VALUES (?, ?, ?)
              RETURNING id",
        )
        .bind(source_id)
        .bind(started_at)
        .bind(RunStatus::Running.as_str())
        .fetch_one(self.db.pool())
        .await?;
        Ok(row.get("id"))
    }

    #[instrument(skip(self, patch), fields(status = ?patch.status))]
    async fn update_run_log(&self, id: i64, patch: &RunLogPatch) -> Result<()> {
        let counts = patch.counts;
        let completed_at = patch
            .status
            .filter(RunStatus::is_terminal)
            .map(|_| Utc::now());

        let result = sqlx::query(
            r"UPDATE harvest_runs
              SET status = COALESCE(?, status),
                  records_processed = COALESCE(?, records_processed),
                  records_added = COALESCE(?, records_added),
                  records_updated = COALESCE(?, records_updated),
                  records_failed = COALESCE(?, records_failed),
                  error_message = COALESCE(?, error_message),
                  completed_at = COALESCE(?, completed_at)
              WHERE id = ? AND status = ?",
        )
        .bind(patch.status.map(|s| s.as_str()))
        .bind(counts.map(|c| c.processed))
        .bind(counts.map(|c| c.added))
        .bind(counts.map(|c| c.updated))
        .bind(counts.map(|c| c.failed))
        .bind(patch.error_message.as_deref())
        .bind(completed_at)
        .bind(id)
        .bind(RunStatus::Running.as_str())
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.get_run_log(id).await? {
            Some(_) => Err(StoreError::RunFinalized(id)),
            None => Err(StoreError::RunNotFound(id)),
        }
    }

    #[instrument(skip(self, patch))]
    async fn update_source_state(&self, id: i64, patch: &SourceStatePatch) -> Result<()> {
        let (set_token, token) = match &patch.resumption_token {
            Some(token) => (true, token.as_deref()),
            None => (false, None),
        };

        let result = sqlx::query(
            r"UPDATE harvest_sources
              SET status = COALESCE(?, status),
                  resumption_token = CASE WHEN ? THEN ? ELSE resumption_token END,
                  last_harvested_at = COALESCE(?, last_harvested_at),
                  updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
              WHERE id = ?",
        )
        .bind(patch.status.map(|s| s.as_str()))
        .bind(set_token)
        .bind(token)
        .bind(patch.last_harvested_at)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected(result.rows_affected(), StoreError::SourceNotFound(id))
    }

    #[instrument(skip(self, query), fields(term = %query.term))]
    async fn search_records(&self, query: &SearchQuery, limit: u32) -> Result<Vec<StoredRecord>> {
        let mut conn = self.db.pool().acquire().await?;
        records::search(&mut conn, query, limit).await
    }
}
