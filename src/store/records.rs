//! Record persistence: identity lookup, merge-on-upsert, and local search.

use serde::Serialize;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection};
use tracing::{debug, warn};

use crate::merge::{IdentityKey, UpsertAction, merge_records};
use crate::record::{Author, NormalizedRecord, RecordFields};
use crate::search::SearchQuery;

use super::{Result, StoreError};

/// A record as stored, with row bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    /// Row id.
    pub id: i64,
    /// The normalized record.
    pub record: NormalizedRecord,
    /// False once the endpoint reported the record deleted.
    pub active: bool,
    /// First sighting.
    pub created_at: String,
    /// Last merge.
    pub updated_at: String,
}

/// Distinct provider with its active record count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct ProviderSummary {
    /// Provider name.
    pub provider: String,
    /// Number of active records.
    pub record_count: i64,
}

#[derive(Debug, FromRow)]
pub(crate) struct RecordRow {
    id: i64,
    provider: String,
    record_id: String,
    doi: Option<String>,
    source_id: Option<i64>,
    title: Option<String>,
    authors: String,
    abstract_text: Option<String>,
    publication_date: Option<String>,
    journal: Option<String>,
    url: Option<String>,
    keywords: String,
    open_access: Option<bool>,
    extra: String,
    active: bool,
    created_at: String,
    updated_at: String,
}

impl TryFrom<RecordRow> for StoredRecord {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self> {
        let authors: Vec<Author> = serde_json::from_str(&row.authors)
            .map_err(|e| StoreError::invalid_column("authors", e))?;
        let keywords: Vec<String> = serde_json::from_str(&row.keywords)
            .map_err(|e| StoreError::invalid_column("keywords", e))?;
        let extra = serde_json::from_str(&row.extra)
            .map_err(|e| StoreError::invalid_column("extra", e))?;

        Ok(Self {
            id: row.id,
            record: NormalizedRecord {
                provider: row.provider,
                record_id: row.record_id,
                source_id: row.source_id,
                fields: RecordFields {
                    title: row.title,
                    authors,
                    abstract_text: row.abstract_text,
                    publication_date: row.publication_date,
                    journal: row.journal,
                    url: row.url,
                    doi: row.doi,
                    keywords,
                    open_access: row.open_access,
                    extra,
                },
            },
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

struct EncodedLists {
    authors: String,
    keywords: String,
    extra: String,
}

fn encode_lists(fields: &RecordFields) -> Result<EncodedLists> {
    Ok(EncodedLists {
        authors: serde_json::to_string(&fields.authors)
            .map_err(|e| StoreError::invalid_column("authors", e))?,
        keywords: serde_json::to_string(&fields.keywords)
            .map_err(|e| StoreError::invalid_column("keywords", e))?,
        extra: serde_json::to_string(&fields.extra)
            .map_err(|e| StoreError::invalid_column("extra", e))?,
    })
}

async fn fetch_by_doi(
    conn: &mut SqliteConnection,
    provider: &str,
    doi: &str,
) -> Result<Option<StoredRecord>> {
    sqlx::query_as::<_, RecordRow>("SELECT * FROM records WHERE provider = ? AND doi = ?")
        .bind(provider)
        .bind(doi)
        .fetch_optional(&mut *conn)
        .await?
        .map(StoredRecord::try_from)
        .transpose()
}

async fn fetch_by_record_id(
    conn: &mut SqliteConnection,
    provider: &str,
    record_id: &str,
) -> Result<Option<StoredRecord>> {
    sqlx::query_as::<_, RecordRow>(
        "SELECT * FROM records WHERE provider = ? AND record_id = ? ORDER BY id LIMIT 1",
    )
    .bind(provider)
    .bind(record_id)
    .fetch_optional(&mut *conn)
    .await?
    .map(StoredRecord::try_from)
    .transpose()
}

/// Resolves the stored row an incoming record should merge into.
///
/// DOI match first; otherwise a record-id match whose stored DOI is absent or
/// equal. A record-id row carrying a different DOI is a distinct work.
pub(crate) async fn resolve_identity(
    conn: &mut SqliteConnection,
    record: &NormalizedRecord,
) -> Result<Option<StoredRecord>> {
    let by_record_id = fetch_by_record_id(conn, &record.provider, &record.record_id).await?;

    let IdentityKey::Doi { provider, doi } = IdentityKey::of(record) else {
        return Ok(by_record_id);
    };

    if let Some(by_doi) = fetch_by_doi(conn, &provider, &doi).await? {
        if let Some(other) = by_record_id.as_ref().filter(|r| r.id != by_doi.id) {
            warn!(
                provider = %provider,
                doi = %doi,
                record_id = %record.record_id,
                doi_row = by_doi.id,
                record_id_row = other.id,
                "merge conflict: DOI and record id resolve to different rows; using DOI match"
            );
        }
        return Ok(Some(by_doi));
    }

    match by_record_id {
        Some(candidate)
            if candidate
                .record
                .fields
                .doi
                .as_deref()
                .is_none_or(|stored| stored == doi) =>
        {
            Ok(Some(candidate))
        }
        Some(candidate) => {
            warn!(
                provider = %provider,
                record_id = %record.record_id,
                stored_doi = ?candidate.record.fields.doi,
                incoming_doi = %doi,
                "merge conflict: record id reused with a different DOI; storing as a new record"
            );
            Ok(None)
        }
        None => Ok(None),
    }
}

/// Inserts or merges one record on an open connection/transaction.
pub(crate) async fn upsert_one(
    conn: &mut SqliteConnection,
    record: &NormalizedRecord,
) -> Result<UpsertAction> {
    match resolve_identity(conn, record).await? {
        Some(mut stored) => {
            merge_records(&mut stored.record, record.clone());
            let merged = &stored.record;
            let lists = encode_lists(&merged.fields)?;
            sqlx::query(
                r"UPDATE records
                  SET doi = ?, source_id = ?, title = ?, authors = ?, abstract_text = ?,
                      publication_date = ?, journal = ?, url = ?, keywords = ?,
                      open_access = ?, extra = ?, active = 1,
                      updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                  WHERE id = ?",
            )
            .bind(merged.fields.doi.as_deref())
            .bind(merged.source_id)
            .bind(merged.fields.title.as_deref())
            .bind(&lists.authors)
            .bind(merged.fields.abstract_text.as_deref())
            .bind(merged.fields.publication_date.as_deref())
            .bind(merged.fields.journal.as_deref())
            .bind(merged.fields.url.as_deref())
            .bind(&lists.keywords)
            .bind(merged.fields.open_access)
            .bind(&lists.extra)
            .bind(stored.id)
            .execute(&mut *conn)
            .await?;
            debug!(row = stored.id, identity = %IdentityKey::of(record), "merged record");
            Ok(UpsertAction::Updated)
        }
        None => {
            let lists = encode_lists(&record.fields)?;
            sqlx::query(
                r"INSERT INTO records (
                    provider, record_id, doi, source_id, title, authors, abstract_text,
                    publication_date, journal, url, keywords, open_access, extra
                  )
                  VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&record.provider)
            .bind(&record.record_id)
            .bind(record.fields.doi.as_deref())
            .bind(record.source_id)
            .bind(record.fields.title.as_deref())
            .bind(&lists.authors)
            .bind(record.fields.abstract_text.as_deref())
            .bind(record.fields.publication_date.as_deref())
            .bind(record.fields.journal.as_deref())
            .bind(record.fields.url.as_deref())
            .bind(&lists.keywords)
            .bind(record.fields.open_access)
            .bind(&lists.extra)
            .execute(&mut *conn)
            .await?;
            debug!(identity = %IdentityKey::of(record), "inserted record");
            Ok(UpsertAction::Added)
        }
    }
}

/// Runs a filtered full-text-ish search over active stored records.
pub(crate) async fn search(
    conn: &mut SqliteConnection,
    query: &SearchQuery,
    limit: u32,
) -> Result<Vec<StoredRecord>> {
    let mut builder: QueryBuilder<Sqlite> =
        QueryBuilder::new("SELECT * FROM records WHERE active = 1");

    let term = query.term.trim();
    if !term.is_empty() {
        let pattern = format!("%{}%", term.to_lowercase());
        builder.push(" AND (lower(coalesce(title, '')) LIKE ");
        builder.push_bind(pattern.clone());
        builder.push(" OR lower(coalesce(abstract_text, '')) LIKE ");
        builder.push_bind(pattern.clone());
        builder.push(" OR lower(keywords) LIKE ");
        builder.push_bind(pattern);
        builder.push(")");
    }

    let filters = &query.filters;
    if let Some(from) = filters.date_from.as_deref() {
        builder.push(" AND publication_date IS NOT NULL AND substr(publication_date, 1, ");
        builder.push_bind(i64::try_from(from.len()).unwrap_or(i64::MAX));
        builder.push(") >= ");
        builder.push_bind(from.to_string());
    }
    if let Some(to) = filters.date_to.as_deref() {
        builder.push(" AND publication_date IS NOT NULL AND substr(publication_date, 1, ");
        builder.push_bind(i64::try_from(to.len()).unwrap_or(i64::MAX));
        builder.push(") <= ");
        builder.push_bind(to.to_string());
    }
    if !filters.authors.is_empty() {
        builder.push(" AND (");
        for (index, author) in filters.authors.iter().enumerate() {
            if index > 0 {
                builder.push(" OR ");
            }
            builder.push("lower(authors) LIKE ");
            builder.push_bind(format!("%{}%", author.to_lowercase()));
        }
        builder.push(")");
    }
    if !filters.journals.is_empty() {
        builder.push(" AND lower(coalesce(journal, '')) IN (");
        let mut separated = builder.separated(", ");
        for journal in &filters.journals {
            separated.push_bind(journal.to_lowercase());
        }
        separated.push_unseparated(")");
    }

    builder.push(" ORDER BY publication_date DESC, id ASC LIMIT ");
    builder.push_bind(i64::from(limit));

    builder
        .build_query_as::<RecordRow>()
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(StoredRecord::try_from)
        .collect()
}
