//! MARC 21 (MARCXML) field mapping.
//!
//! Reads `datafield`/`subfield` elements by tag and code:
//!
//! | Tag | Field |
//! |---|---|
//! | 245 `a` `b` | title |
//! | 100, 700 `a` (`u` affiliation, `0` identifier) | authors |
//! | 520 `a` | abstract |
//! | 260/264 `c` | publication date (`b` publisher) |
//! | 773 `t` | journal |
//! | 856 `u` | url |
//! | 024 `a` with `2` = doi | DOI |
//! | 650/653 `a` | keywords |
//! | 506 ind1 | open access |

use serde_json::{Map, Value};

use crate::record::Author;

use super::{Extracted, by_local_name, texts};

struct DataField<'a> {
    tag: &'a str,
    ind1: &'a str,
    element: &'a Map<String, Value>,
}

impl DataField<'_> {
    fn subfields(&self, code: &str) -> Vec<String> {
        by_local_name(self.element, "subfield")
            .into_iter()
            .flat_map(|v| match v {
                Value::Array(items) => items.iter().collect::<Vec<_>>(),
                other => vec![other],
            })
            .filter(|sub| sub.get("@code").and_then(Value::as_str) == Some(code))
            .flat_map(texts)
            .collect()
    }

    fn subfield(&self, code: &str) -> Option<String> {
        self.subfields(code).into_iter().next()
    }
}

fn objects(value: &Value) -> Vec<&Map<String, Value>> {
    match value {
        Value::Object(map) => vec![map],
        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
        _ => Vec::new(),
    }
}

/// Collects datafields; accepts both `<record>` and a `<collection>` wrapping one record.
fn datafields(map: &Map<String, Value>) -> Vec<DataField<'_>> {
    let record = by_local_name(map, "record")
        .into_iter()
        .flat_map(objects)
        .next()
        .unwrap_or(map);

    by_local_name(record, "datafield")
        .into_iter()
        .flat_map(objects)
        .map(|element| DataField {
            tag: element.get("@tag").and_then(Value::as_str).unwrap_or(""),
            ind1: element.get("@ind1").and_then(Value::as_str).unwrap_or(" "),
            element,
        })
        .collect()
}

fn strip_isbd(value: &str) -> String {
    value
        .trim()
        .trim_end_matches([' ', '/', ':', ';', ',', '.'])
        .trim()
        .to_string()
}

fn author(field: &DataField<'_>) -> Option<Author> {
    let name = strip_isbd(&field.subfield("a")?);
    (!name.is_empty()).then(|| Author {
        name,
        identifier: field.subfield("0"),
        affiliation: field.subfield("u"),
    })
}

pub(crate) fn extract(map: &Map<String, Value>) -> Extracted {
    let mut out = Extracted::default();
    let fields = datafields(map);

    for field in &fields {
        let record = &mut out.fields;
        match field.tag {
            "245" if record.title.is_none() => {
                let parts: Vec<String> = ["a", "b"]
                    .iter()
                    .filter_map(|code| field.subfield(code))
                    .map(|s| strip_isbd(&s))
                    .filter(|s| !s.is_empty())
                    .collect();
                if !parts.is_empty() {
                    record.title = Some(parts.join(": "));
                }
            }
            "100" | "700" => record.authors.extend(author(field)),
            "520" if record.abstract_text.is_none() => record.abstract_text = field.subfield("a"),
            "260" | "264" => {
                if record.publication_date.is_none() {
                    record.publication_date = field.subfield("c");
                }
                if let Some(publisher) = field.subfield("b") {
                    record
                        .extra
                        .entry("publisher")
                        .or_insert_with(|| Value::String(strip_isbd(&publisher)));
                }
            }
            "773" if record.journal.is_none() => {
                record.journal = field.subfield("t").map(|t| strip_isbd(&t));
            }
            "856" => out.identifiers.extend(field.subfields("u")),
            "024" => {
                let is_doi = field
                    .subfield("2")
                    .is_some_and(|scheme| scheme.eq_ignore_ascii_case("doi"));
                if is_doi && record.doi.is_none() {
                    record.doi = field.subfield("a");
                } else {
                    out.identifiers.extend(field.subfields("a"));
                }
            }
            "650" | "653" => record
                .keywords
                .extend(field.subfields("a").iter().map(|k| strip_isbd(k))),
            "506" => record.open_access = Some(field.ind1 == "0"),
            "022" => {
                if let Some(issn) = field.subfield("a") {
                    record.extra.insert("issn".to_string(), Value::String(issn));
                }
            }
            _ => {}
        }
    }

    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::oai::decode_list_records;
    use crate::schema::{SchemaId, parse};

    const PAGE: &str = r#"<OAI-PMH><ListRecords><record>
      <header><identifier>oai:lib:marc-1</identifier></header>
      <metadata>
        <marc:record xmlns:marc="http://www.loc.gov/MARC21/slim">
          <marc:leader>00000nab a2200000 i 4500</marc:leader>
          <marc:controlfield tag="001">991</marc:controlfield>
          <marc:datafield tag="024" ind1="7" ind2=" ">
            <marc:subfield code="a">10.1000/XYZ.1</marc:subfield>
            <marc:subfield code="2">doi</marc:subfield>
          </marc:datafield>
          <marc:datafield tag="100" ind1="1" ind2=" ">
            <marc:subfield code="a">Doe, Jane,</marc:subfield>
            <marc:subfield code="u">Example University</marc:subfield>
          </marc:datafield>
          <marc:datafield tag="245" ind1="1" ind2="0">
            <marc:subfield code="a">Rivers of trade :</marc:subfield>
            <marc:subfield code="b">a history /</marc:subfield>
          </marc:datafield>
          <marc:datafield tag="264" ind1=" " ind2="1">
            <marc:subfield code="b">Example Press,</marc:subfield>
            <marc:subfield code="c">2017.</marc:subfield>
          </marc:datafield>
          <marc:datafield tag="506" ind1="0" ind2=" ">
            <marc:subfield code="a">Open access</marc:subfield>
          </marc:datafield>
          <marc:datafield tag="520" ind1=" " ind2=" ">
            <marc:subfield code="a">Summary text.</marc:subfield>
          </marc:datafield>
          <marc:datafield tag="650" ind1=" " ind2="0">
            <marc:subfield code="a">Commerce.</marc:subfield>
          </marc:datafield>
          <marc:datafield tag="700" ind1="1" ind2=" ">
            <marc:subfield code="a">Roe, Richard.</marc:subfield>
          </marc:datafield>
          <marc:datafield tag="773" ind1="0" ind2=" ">
            <marc:subfield code="t">Journal of Rivers.</marc:subfield>
          </marc:datafield>
          <marc:datafield tag="856" ind1="4" ind2="0">
            <marc:subfield code="u">https://muse.jhu.edu/article/55</marc:subfield>
          </marc:datafield>
        </marc:record>
      </metadata>
    </record></ListRecords></OAI-PMH>"#;

    #[test]
    fn test_parse_marc_record() {
        let page = decode_list_records(PAGE).unwrap();
        let record = parse(&page.records[0], SchemaId::Marc).unwrap();
        let fields = &record.fields;

        assert_eq!(fields.title.as_deref(), Some("Rivers of trade: a history"));
        assert_eq!(fields.authors.len(), 2);
        assert_eq!(fields.authors[0].name, "Doe, Jane");
        assert_eq!(fields.authors[0].affiliation.as_deref(), Some("Example University"));
        assert_eq!(fields.authors[1].name, "Roe, Richard");
        assert_eq!(fields.doi.as_deref(), Some("10.1000/xyz.1"));
        assert_eq!(fields.publication_date.as_deref(), Some("2017"));
        assert_eq!(fields.abstract_text.as_deref(), Some("Summary text."));
        assert_eq!(fields.journal.as_deref(), Some("Journal of Rivers"));
        assert_eq!(fields.keywords, vec!["Commerce"]);
        assert_eq!(fields.open_access, Some(true));
        assert_eq!(fields.extra["publisher"], "Example Press");
        assert_eq!(fields.url.as_deref(), Some("https://muse.jhu.edu/article/55"));
        assert_eq!(record.provider, "project_muse");
    }

    #[test]
    fn test_single_subfield_is_not_an_array() {
        let map = serde_json::json!({
            "datafield": {"@tag": "245", "@ind1": "0", "subfield": {"@code": "a", "#text": "Solo"}}
        });
        let out = extract(map.as_object().unwrap());
        assert_eq!(out.fields.title.as_deref(), Some("Solo"));
    }
}
