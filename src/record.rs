//! Normalized bibliographic record types shared by parsers, enrichment, and the store.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single author credit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    /// Display name (`Family, Given` when both parts are known).
    pub name: String,
    /// Persistent identifier such as an ORCID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    /// Institutional affiliation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affiliation: Option<String>,
}

impl Author {
    /// Creates an author with only a display name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identifier: None,
            affiliation: None,
        }
    }
}

/// The mergeable bibliographic payload of a record.
///
/// Every field is optional or may be empty; the merge rule in
/// [`crate::merge::merge_fields`] decides which side wins per field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordFields {
    /// Work title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Ordered author list.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<Author>,
    /// Abstract text.
    #[serde(default, rename = "abstract", skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    /// Publication date normalized to `YYYY[-MM[-DD]]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_date: Option<String>,
    /// Journal or venue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<String>,
    /// Landing page URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Lowercased DOI without resolver prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    /// Subject keywords.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    /// Open-access flag, `None` when unknown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_access: Option<bool>,
    /// Schema-specific leftovers (publisher, language, rights...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl RecordFields {
    /// Returns the title if it holds non-whitespace text.
    #[must_use]
    pub fn title_text(&self) -> Option<&str> {
        self.title.as_deref().filter(|t| !t.trim().is_empty())
    }
}

/// The canonical harvested unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    /// Content provider (e.g. `jstor`), lowercased.
    pub provider: String,
    /// Source-native record identifier (the OAI header identifier).
    pub record_id: String,
    /// Owning harvest source, when harvested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<i64>,
    /// Bibliographic payload.
    #[serde(flatten)]
    pub fields: RecordFields,
}

impl NormalizedRecord {
    /// Creates a record with an empty payload.
    #[must_use]
    pub fn new(provider: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            record_id: record_id.into(),
            source_id: None,
            fields: RecordFields::default(),
        }
    }
}

impl fmt::Display for NormalizedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NormalizedRecord {{ provider: {}, record_id: {}, doi: {} }}",
            self.provider,
            self.record_id,
            self.fields.doi.as_deref().unwrap_or("-")
        )
    }
}

/// Normalizes a free-form date into `YYYY[-MM[-DD]]`.
///
/// Accepts ISO dates and datetimes (`2024-06-15T00:00:00Z`), `YYYY-MM`,
/// bare years, and strings that merely contain a year (`c1998.`).
#[must_use]
pub fn normalize_date(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let date_part = trimmed.split(['T', ' ']).next().unwrap_or(trimmed);
    let parts: Vec<&str> = date_part.split(['-', '/']).collect();

    let year = parts.first().filter(|y| is_year(y));
    if let Some(year) = year {
        let month = parts.get(1).and_then(|m| two_digit_in(m, 1, 12));
        let day = month.and(parts.get(2).and_then(|d| two_digit_in(d, 1, 31)));
        return Some(match (month, day) {
            (Some(m), Some(d)) => format!("{year}-{m:02}-{d:02}"),
            (Some(m), None) => format!("{year}-{m:02}"),
            _ => (*year).to_string(),
        });
    }

    trimmed
        .as_bytes()
        .windows(4)
        .position(|w| w.iter().all(u8::is_ascii_digit) && (w[0] == b'1' || w[0] == b'2'))
        .map(|start| trimmed[start..start + 4].to_string())
}

fn is_year(value: &str) -> bool {
    value.len() == 4 && value.bytes().all(|b| b.is_ascii_digit())
}

fn two_digit_in(value: &str, min: u32, max: u32) -> Option<u32> {
    if value.is_empty() || value.len() > 2 {
        return None;
    }
    value
        .parse::<u32>()
        .ok()
        .filter(|n| (min..=max).contains(n))
}

/// Sort key for a normalized publication date; missing parts count as 0.
#[must_use]
pub fn date_sort_key(date: Option<&str>) -> Option<(u32, u32, u32)> {
    let date = date?;
    let mut parts = date.split('-').map(|p| p.parse::<u32>().ok());
    let year = parts.next().flatten()?;
    let month = parts.next().flatten().unwrap_or(0);
    let day = parts.next().flatten().unwrap_or(0);
    Some((year, month, day))
}
