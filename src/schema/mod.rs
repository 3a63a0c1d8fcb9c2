//! Metadata schema parsers.
//!
//! Turns a fetched [`RawRecord`] into a [`NormalizedRecord`]. The parser is
//! selected from the source's metadata prefix; unknown prefixes fall back to
//! a best-effort alias extractor. Every parser only extracts raw field
//! values: DOI detection, URL selection, date normalization, and provider
//! inference run afterwards, in one place, for every schema.
//!
//! Parsing fails only when a record has neither a title nor any identifier
//! (DOI, URL, or identifier field), since it could not be deduplicated.

mod doi;
mod dublin_core;
mod generic;
mod marc;
mod provider;

pub use doi::find_doi;
pub use provider::{canonical_host, infer_provider};

use std::collections::HashSet;
use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::trace;

use crate::oai::RawRecord;
use crate::record::{NormalizedRecord, RecordFields, normalize_date};

/// Provider assigned when neither the metadata nor any URL names one.
pub const UNKNOWN_PROVIDER: &str = "unknown";

/// Errors produced while parsing a single record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The record carries no metadata payload.
    #[error("record {identifier} has no metadata")]
    MissingMetadata {
        /// Header identifier
        identifier: String,
    },

    /// The metadata payload is not a structured element.
    #[error("record {identifier} metadata is not structured ({found})")]
    UnexpectedShape {
        /// Header identifier
        identifier: String,
        /// What was found instead
        found: &'static str,
    },

    /// Neither a title nor an identifier could be extracted.
    #[error("record {identifier} has no extractable title or identifier")]
    Unidentifiable {
        /// Header identifier
        identifier: String,
    },
}

/// Metadata schema a record is encoded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaId {
    /// `oai_dc` unqualified Dublin Core.
    DublinCore,
    /// MARC 21 in MARCXML.
    Marc,
    /// Anything else: alias-based extraction.
    Generic,
}

impl SchemaId {
    /// Selects a schema from an OAI-PMH metadata prefix.
    #[must_use]
    pub fn from_prefix(prefix: &str) -> Self {
        match prefix.trim().to_ascii_lowercase().as_str() {
            "oai_dc" | "dc" => Self::DublinCore,
            "marc21" | "marcxml" | "marc" | "oai_marc" => Self::Marc,
            _ => Self::Generic,
        }
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::DublinCore => "dublin_core",
            Self::Marc => "marc",
            Self::Generic => "generic",
        };
        write!(f, "{label}")
    }
}

/// Raw values pulled out of a metadata payload by a schema parser.
#[derive(Debug, Default)]
pub(crate) struct Extracted {
    /// Directly mapped fields; `doi`/`url` may still be empty here.
    pub fields: RecordFields,
    /// Candidate identifiers (DOIs, URLs, URNs) in document order.
    pub identifiers: Vec<String>,
    /// Provider named explicitly by the metadata.
    pub provider: Option<String>,
}

/// Parses a raw record with the given schema.
///
/// # Errors
///
/// Returns [`ParseError`] when the record has no usable metadata or
/// neither a title nor an identifier.
pub fn parse(raw: &RawRecord, schema: SchemaId) -> Result<NormalizedRecord, ParseError> {
    let identifier = &raw.header.identifier;
    let metadata = raw
        .metadata
        .as_ref()
        .ok_or_else(|| ParseError::MissingMetadata {
            identifier: identifier.clone(),
        })?;
    let Value::Object(map) = metadata else {
        return Err(ParseError::UnexpectedShape {
            identifier: identifier.clone(),
            found: shape_name(metadata),
        });
    };

    let extracted = match schema {
        SchemaId::DublinCore => dublin_core::extract(map),
        SchemaId::Marc => marc::extract(map),
        SchemaId::Generic => generic::extract(map),
    };
    finish(identifier, extracted)
}

fn finish(identifier: &str, extracted: Extracted) -> Result<NormalizedRecord, ParseError> {
    let Extracted {
        mut fields,
        identifiers,
        provider,
    } = extracted;

    fields.doi = fields
        .doi
        .as_deref()
        .and_then(find_doi)
        .or_else(|| identifiers.iter().find_map(|id| find_doi(id)));
    if fields.url.is_none() {
        fields.url = identifiers
            .iter()
            .find(|id| is_http_url(id) && find_doi(id).is_none())
            .or_else(|| identifiers.iter().find(|id| is_http_url(id)))
            .cloned();
    }
    fields.publication_date = fields.publication_date.as_deref().and_then(normalize_date);
    let mut seen = HashSet::new();
    fields
        .keywords
        .retain(|k| !k.is_empty() && seen.insert(k.clone()));

    let has_identifier =
        fields.doi.is_some() || fields.url.is_some() || !identifiers.is_empty();
    if fields.title_text().is_none() && !has_identifier {
        return Err(ParseError::Unidentifiable {
            identifier: identifier.to_string(),
        });
    }

    // Inference runs after extraction so allow-list filtering sees the URL host.
    let provider = provider
        .map(|p| p.trim().to_ascii_lowercase())
        .filter(|p| !p.is_empty())
        .or_else(|| fields.url.as_deref().and_then(infer_provider))
        .or_else(|| identifiers.iter().find_map(|id| infer_provider(id)))
        .unwrap_or_else(|| UNKNOWN_PROVIDER.to_string());

    trace!(identifier, provider = %provider, doi = ?fields.doi, "parsed record");

    let mut record = NormalizedRecord::new(provider, identifier);
    record.fields = fields;
    Ok(record)
}

fn is_http_url(value: &str) -> bool {
    let lower = value.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn shape_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "text",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Flattens a converted XML value into its text strings.
///
/// Strings yield themselves, arrays yield each item, objects yield their
/// `#text` content.
pub(crate) fn texts(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                Vec::new()
            } else {
                vec![s.to_string()]
            }
        }
        Value::Array(items) => items.iter().flat_map(texts).collect(),
        Value::Object(map) => map.get("#text").map(texts).unwrap_or_default(),
        Value::Number(n) => vec![n.to_string()],
        Value::Bool(_) | Value::Null => Vec::new(),
    }
}

/// Values of every key whose local name (namespace prefix dropped) is `name`.
pub(crate) fn by_local_name<'a>(map: &'a Map<String, Value>, name: &str) -> Vec<&'a Value> {
    map.iter()
        .filter(|(key, _)| {
            !key.starts_with('@') && key.rsplit_once(':').map_or(key.as_str(), |(_, l)| l) == name
        })
        .map(|(_, value)| value)
        .collect()
}

/// All texts under keys with local name `name`.
pub(crate) fn local_texts(map: &Map<String, Value>, name: &str) -> Vec<String> {
    by_local_name(map, name).into_iter().flat_map(texts).collect()
}
