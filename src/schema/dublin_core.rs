//! Unqualified Dublin Core (`oai_dc`) field mapping.

use serde_json::{Map, Value};

use crate::record::Author;

use super::{Extracted, local_texts};

/// Rights statements that mark a work as openly available.
const OPEN_ACCESS_MARKERS: &[&str] = &[
    "info:eu-repo/semantics/openaccess",
    "open access",
    "creativecommons.org",
];

/// Rights statements that mark a work as restricted.
const CLOSED_ACCESS_MARKERS: &[&str] = &[
    "info:eu-repo/semantics/closedaccess",
    "info:eu-repo/semantics/restrictedaccess",
    "info:eu-repo/semantics/embargoedaccess",
];

fn first(map: &Map<String, Value>, name: &str) -> Option<String> {
    local_texts(map, name).into_iter().next()
}

fn open_access_from_rights(rights: &[String]) -> Option<bool> {
    let lowered: Vec<String> = rights.iter().map(|r| r.to_ascii_lowercase()).collect();
    if lowered
        .iter()
        .any(|r| CLOSED_ACCESS_MARKERS.iter().any(|m| r.contains(m)))
    {
        return Some(false);
    }
    lowered
        .iter()
        .any(|r| OPEN_ACCESS_MARKERS.iter().any(|m| r.contains(m)))
        .then_some(true)
}

pub(crate) fn extract(map: &Map<String, Value>) -> Extracted {
    let mut out = Extracted::default();
    let fields = &mut out.fields;

    fields.title = local_texts(map, "title").into_iter().next();
    fields.authors = local_texts(map, "creator")
        .into_iter()
        .map(Author::named)
        .collect();
    fields.abstract_text = {
        let descriptions = local_texts(map, "description");
        (!descriptions.is_empty()).then(|| descriptions.join("\n\n"))
    };
    fields.publication_date = first(map, "date");
    fields.journal = first(map, "source");
    fields.keywords = local_texts(map, "subject");
    fields.open_access = open_access_from_rights(&local_texts(map, "rights"));

    for (name, key) in [
        ("publisher", "publisher"),
        ("language", "language"),
        ("type", "type"),
        ("format", "format"),
        ("contributor", "contributors"),
        ("relation", "relations"),
    ] {
        let values = local_texts(map, name);
        match values.len() {
            0 => {}
            1 => {
                fields
                    .extra
                    .insert(key.to_string(), Value::String(values[0].clone()));
            }
            _ => {
                fields.extra.insert(
                    key.to_string(),
                    Value::Array(values.into_iter().map(Value::String).collect()),
                );
            }
        }
    }

    out.identifiers = local_texts(map, "identifier");
    out
}
