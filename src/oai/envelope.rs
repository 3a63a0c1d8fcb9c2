//! `ListRecords` response envelope decoding.

use tracing::debug;

use super::xml::{XmlElement, parse_document};
use super::{ListPage, ProtocolError, RawRecord, RecordHeader};

fn decode_header(element: &XmlElement) -> Result<RecordHeader, ProtocolError> {
    let identifier = element
        .child_text("identifier")
        .ok_or_else(|| ProtocolError::Envelope("record header without identifier".to_string()))?;
    Ok(RecordHeader {
        identifier: identifier.to_string(),
        datestamp: element.child_text("datestamp").map(ToString::to_string),
        status: element.attr("status").map(ToString::to_string),
        set_specs: element
            .children_named("setSpec")
            .map(|s| s.text.clone())
            .filter(|s| !s.is_empty())
            .collect(),
    })
}

fn decode_record(element: &XmlElement) -> Result<RawRecord, ProtocolError> {
    let header = element
        .child("header")
        .ok_or_else(|| ProtocolError::Envelope("record without header".to_string()))?;
    let metadata = element
        .child("metadata")
        .and_then(|m| m.children.first())
        .map(XmlElement::to_value);
    Ok(RawRecord {
        header: decode_header(header)?,
        metadata,
    })
}

/// Decodes a `ListRecords` response body into one page.
///
/// # Errors
///
/// Returns the typed protocol error for an `<error>` element, or
/// [`ProtocolError::Envelope`] when the body is not a `ListRecords` envelope.
pub fn decode_list_records(body: &str) -> Result<ListPage, ProtocolError> {
    let root = parse_document(body)?;
    if root.local_name() != "OAI-PMH" {
        return Err(ProtocolError::Envelope(format!(
            "unexpected root element <{}>",
            root.name
        )));
    }

    if let Some(error) = root.child("error") {
        let code = error.attr("code").unwrap_or("unknown");
        return Err(ProtocolError::from_oai_code(code, error.text.clone()));
    }

    let list = root
        .child("ListRecords")
        .ok_or_else(|| ProtocolError::Envelope("missing <ListRecords> element".to_string()))?;

    let records = list
        .children_named("record")
        .map(decode_record)
        .collect::<Result<Vec<_>, _>>()?;

    let token_element = list.child("resumptionToken");
    let resumption_token = token_element
        .map(|t| t.text.trim().to_string())
        .filter(|t| !t.is_empty());
    let complete_list_size = token_element
        .and_then(|t| t.attr("completeListSize"))
        .and_then(|s| s.parse().ok());

    debug!(
        records = records.len(),
        has_token = resumption_token.is_some(),
        complete_list_size,
        "decoded ListRecords page"
    );

    Ok(ListPage {
        records,
        resumption_token,
        complete_list_size,
    })
}
