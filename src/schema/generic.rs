//! Best-effort extractor for unrecognized schemas.
//!
//! Each field has an ordered alias list. Aliases are tried against the
//! top-level keys first, then against the keys of each directly nested
//! object (one level deep).

use serde_json::{Map, Value};

use crate::record::Author;

use super::{Extracted, texts};

const TITLE: &[&str] = &["title", "dc:title", "Title", "dcterms:title", "name"];
const AUTHORS: &[&str] = &[
    "creator",
    "dc:creator",
    "Creator",
    "author",
    "authors",
    "Author",
    "dcterms:creator",
];
const ABSTRACT: &[&str] = &[
    "abstract",
    "description",
    "dc:description",
    "Abstract",
    "dcterms:abstract",
    "summary",
];
const DATE: &[&str] = &[
    "date",
    "dc:date",
    "Date",
    "publicationDate",
    "publication_date",
    "dcterms:issued",
    "issued",
    "year",
];
const JOURNAL: &[&str] = &[
    "journal",
    "journalTitle",
    "source",
    "dc:source",
    "container-title",
    "dcterms:isPartOf",
];
const DOI: &[&str] = &["doi", "DOI", "dc:identifier.doi"];
const URL: &[&str] = &["url", "URL", "link", "uri"];
const IDENTIFIER: &[&str] = &["identifier", "dc:identifier", "Identifier", "dcterms:identifier", "id"];
const KEYWORDS: &[&str] = &["subject", "dc:subject", "keywords", "keyword", "Subject", "dcterms:subject"];
const PROVIDER: &[&str] = &["provider", "Provider"];
const PUBLISHER: &[&str] = &["publisher", "dc:publisher", "Publisher", "dcterms:publisher"];

/// Finds the first alias present at the top level, then one level down.
fn lookup<'a>(map: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    if let Some(value) = aliases.iter().find_map(|alias| map.get(*alias)) {
        return Some(value);
    }
    map.values()
        .flat_map(|value| match value {
            Value::Object(inner) => vec![inner],
            Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
            _ => Vec::new(),
        })
        .find_map(|inner| aliases.iter().find_map(|alias| inner.get(*alias)))
}

fn all_texts(map: &Map<String, Value>, aliases: &[&str]) -> Vec<String> {
    lookup(map, aliases).map(texts).unwrap_or_default()
}

fn first_text(map: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    all_texts(map, aliases).into_iter().next()
}

fn authors(map: &Map<String, Value>) -> Vec<Author> {
    let Some(value) = lookup(map, AUTHORS) else {
        return Vec::new();
    };
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::Object(obj) => {
                let name = ["name", "#text", "fullName"]
                    .iter()
                    .find_map(|k| obj.get(*k))
                    .and_then(|v| texts(v).into_iter().next())?;
                Some(Author {
                    name,
                    identifier: ["orcid", "identifier", "@id"]
                        .iter()
                        .find_map(|k| obj.get(*k))
                        .and_then(|v| texts(v).into_iter().next()),
                    affiliation: obj
                        .get("affiliation")
                        .and_then(|v| texts(v).into_iter().next()),
                })
            }
            other => texts(other).into_iter().next().map(Author::named),
        })
        .collect()
}

pub(crate) fn extract(map: &Map<String, Value>) -> Extracted {
    let mut out = Extracted::default();
    let fields = &mut out.fields;

    fields.title = first_text(map, TITLE);
    fields.authors = authors(map);
    fields.abstract_text = first_text(map, ABSTRACT);
    fields.publication_date = first_text(map, DATE);
    fields.journal = first_text(map, JOURNAL);
    fields.doi = first_text(map, DOI);
    fields.url = first_text(map, URL);
    fields.keywords = all_texts(map, KEYWORDS);
    if let Some(publisher) = first_text(map, PUBLISHER) {
        fields
            .extra
            .insert("publisher".to_string(), Value::String(publisher));
    }

    out.identifiers = all_texts(map, IDENTIFIER);
    out.provider = first_text(map, PROVIDER);
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::oai::{RawRecord, RecordHeader};
    use crate::schema::{SchemaId, parse};
    use serde_json::json;

    fn raw(metadata: Value) -> RawRecord {
        RawRecord {
            header: RecordHeader {
                identifier: "oai:generic:1".to_string(),
                ..RecordHeader::default()
            },
            metadata: Some(metadata),
        }
    }

    #[test]
    fn test_top_level_aliases() {
        let record = parse(
            &raw(json!({
                "Title": "Capitalized",
                "author": [{"name": "Doe, Jane", "orcid": "0000-0001"}, "Roe, R."],
                "summary": "Short.",
                "year": "2001",
                "keywords": ["a", "b"],
                "link": "https://www.tandfonline.com/doi/full/10.1080/1"
            })),
            SchemaId::Generic,
        )
        .unwrap();
        let fields = &record.fields;
        assert_eq!(fields.title.as_deref(), Some("Capitalized"));
        assert_eq!(fields.authors[0].identifier.as_deref(), Some("0000-0001"));
        assert_eq!(fields.authors[1].name, "Roe, R.");
        assert_eq!(fields.abstract_text.as_deref(), Some("Short."));
        assert_eq!(fields.publication_date.as_deref(), Some("2001"));
        assert_eq!(fields.keywords, vec!["a", "b"]);
        assert_eq!(record.provider, "taylor_francis");
    }

    #[test]
    fn test_one_level_of_nesting() {
        let record = parse(
            &raw(json!({
                "mods:titleInfo": {"mods:title": "ignored alias", "title": "Nested Title"},
                "mods:location": {"url": "https://stable.jstor.org/99"}
            })),
            SchemaId::Generic,
        )
        .unwrap();
        assert_eq!(record.fields.title.as_deref(), Some("Nested Title"));
        assert_eq!(record.provider, "jstor");
    }

    #[test]
    fn test_two_levels_deep_is_not_searched() {
        let err = parse(
            &raw(json!({"outer": {"inner": {"title": "Too deep"}}})),
            SchemaId::Generic,
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_explicit_provider_wins_over_url() {
        let record = parse(
            &raw(json!({
                "title": "T",
                "provider": "ProQuest",
                "url": "https://www.jstor.org/stable/1"
            })),
            SchemaId::Generic,
        )
        .unwrap();
        assert_eq!(record.provider, "proquest");
    }
}
