//! Record identity and the non-degrading field merge rule.
//!
//! Two incoming sightings of the same work are reconciled field by field:
//! a non-empty incoming value replaces the stored one, an empty or absent
//! incoming value never clears a stored one. Author and keyword lists are
//! replaced wholesale, and only when the incoming list is non-empty.
//!
//! The same rule applies when a harvested record is merged into the store
//! and when enrichment results are merged into a freshly parsed record.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::record::{NormalizedRecord, RecordFields};

/// Deduplication identity for a record within one provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    /// Records carrying a DOI are identified by it.
    Doi {
        /// Provider the record belongs to.
        provider: String,
        /// Normalized DOI.
        doi: String,
    },
    /// Records without a DOI fall back to the source-native id.
    RecordId {
        /// Provider the record belongs to.
        provider: String,
        /// Source-native record id.
        record_id: String,
    },
}

impl IdentityKey {
    /// Derives the identity key of a record.
    #[must_use]
    pub fn of(record: &NormalizedRecord) -> Self {
        match record.fields.doi.as_deref().filter(|d| !d.trim().is_empty()) {
            Some(doi) => Self::Doi {
                provider: record.provider.clone(),
                doi: doi.to_string(),
            },
            None => Self::RecordId {
                provider: record.provider.clone(),
                record_id: record.record_id.clone(),
            },
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Doi { provider, doi } => write!(f, "{provider}:doi:{doi}"),
            Self::RecordId {
                provider,
                record_id,
            } => write!(f, "{provider}:id:{record_id}"),
        }
    }
}

/// What an upsert did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    /// First sighting; a new row was written.
    Added,
    /// An existing row was merged in place.
    Updated,
}

impl UpsertAction {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
        }
    }
}

/// Merges `incoming` into `existing` without degrading populated fields.
pub fn merge_fields(existing: &mut RecordFields, incoming: RecordFields) {
    merge_text(&mut existing.title, incoming.title);
    merge_text(&mut existing.abstract_text, incoming.abstract_text);
    merge_text(&mut existing.publication_date, incoming.publication_date);
    merge_text(&mut existing.journal, incoming.journal);
    merge_text(&mut existing.url, incoming.url);
    merge_text(&mut existing.doi, incoming.doi);

    if !incoming.authors.is_empty() {
        existing.authors = incoming.authors;
    }
    if !incoming.keywords.is_empty() {
        existing.keywords = incoming.keywords;
    }
    if incoming.open_access.is_some() {
        existing.open_access = incoming.open_access;
    }

    for (key, value) in incoming.extra {
        if !is_empty_value(&value) {
            existing.extra.insert(key, value);
        }
    }
}

/// Merges a whole incoming record into a stored one.
///
/// Identity columns (`provider`, `record_id`) stay as stored; the owning
/// source follows the latest sighting.
pub fn merge_records(existing: &mut NormalizedRecord, incoming: NormalizedRecord) {
    if incoming.source_id.is_some() {
        existing.source_id = incoming.source_id;
    }
    merge_fields(&mut existing.fields, incoming.fields);
}

fn merge_text(existing: &mut Option<String>, incoming: Option<String>) {
    if let Some(value) = incoming
        && !value.trim().is_empty()
    {
        *existing = Some(value);
    }
}

fn is_empty_value(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        serde_json::Value::Bool(_) | serde_json::Value::Number(_) => false,
    }
}
