//! Minimal XML element tree built on `quick-xml` events.
//!
//! OAI-PMH responses are small enough to hold in memory, and the schema
//! parsers want random access to metadata fields, so the envelope is read
//! into an [`XmlElement`] tree once and then navigated.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde_json::{Map, Value};

use super::ProtocolError;

/// One XML element with its attributes, child elements, and text content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlElement {
    /// Qualified name as written, e.g. `dc:title`.
    pub name: String,
    /// Attributes in document order, qualified names kept.
    pub attributes: Vec<(String, String)>,
    /// Child elements in document order.
    pub children: Vec<XmlElement>,
    /// Concatenated, trimmed text content directly inside this element.
    pub text: String,
}

impl XmlElement {
    /// Name without namespace prefix.
    #[must_use]
    pub fn local_name(&self) -> &str {
        local(&self.name)
    }

    /// First child with the given local name.
    #[must_use]
    pub fn child(&self, local_name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.local_name() == local_name)
    }

    /// All children with the given local name.
    pub fn children_named<'a>(&'a self, local_name: &'a str) -> impl Iterator<Item = &'a XmlElement> {
        self.children
            .iter()
            .filter(move |c| c.local_name() == local_name)
    }

    /// Attribute value by local name.
    #[must_use]
    pub fn attr(&self, local_name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| local(k) == local_name)
            .map(|(_, v)| v.as_str())
    }

    /// Trimmed text of the first child with the given local name, if non-empty.
    #[must_use]
    pub fn child_text(&self, local_name: &str) -> Option<&str> {
        self.child(local_name)
            .map(|c| c.text.as_str())
            .filter(|t| !t.is_empty())
    }

    /// Converts the element's content to a JSON value.
    ///
    /// A leaf without attributes becomes a string. Otherwise an object:
    /// attributes under `@name`, children under their qualified name
    /// (repeated names collapse into an array), and text under `#text`.
    #[must_use]
    pub fn to_value(&self) -> Value {
        if self.children.is_empty() && self.attributes.is_empty() {
            return Value::String(self.text.clone());
        }

        let mut map = Map::new();
        for (key, value) in &self.attributes {
            if key == "xmlns" || key.starts_with("xmlns:") {
                continue;
            }
            map.insert(format!("@{key}"), Value::String(value.clone()));
        }
        for child in &self.children {
            let value = child.to_value();
            match map.get_mut(&child.name) {
                Some(Value::Array(items)) => items.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    map.insert(child.name.clone(), value);
                }
            }
        }
        if !self.text.is_empty() {
            map.insert("#text".to_string(), Value::String(self.text.clone()));
        }
        Value::Object(map)
    }
}

fn local(name: &str) -> &str {
    name.rsplit_once(':').map_or(name, |(_, local)| local)
}

fn start_element(start: &BytesStart<'_>) -> Result<XmlElement, ProtocolError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| ProtocolError::Envelope(format!("bad attribute: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| ProtocolError::Envelope(format!("bad attribute value: {e}")))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(XmlElement {
        name,
        attributes,
        children: Vec::new(),
        text: String::new(),
    })
}

fn append_text(element: &mut XmlElement, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    if !element.text.is_empty() {
        element.text.push(' ');
    }
    element.text.push_str(text);
}

/// Parses a document into its root element.
///
/// # Errors
///
/// Returns [`ProtocolError::Envelope`] for malformed or empty documents.
pub fn parse_document(xml: &str) -> Result<XmlElement, ProtocolError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        let event = reader.read_event().map_err(|e| {
            ProtocolError::Envelope(format!(
                "XML error at byte {}: {e}",
                reader.buffer_position()
            ))
        })?;
        match event {
            Event::Start(start) => stack.push(start_element(&start)?),
            Event::Empty(start) => {
                let element = start_element(&start)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Event::End(_) => {
                let Some(element) = stack.pop() else {
                    return Err(ProtocolError::Envelope("unbalanced end tag".to_string()));
                };
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Event::Text(text) => {
                if let Some(current) = stack.last_mut() {
                    let text = text
                        .unescape()
                        .map_err(|e| ProtocolError::Envelope(format!("bad text: {e}")))?;
                    append_text(current, &text);
                }
            }
            Event::CData(data) => {
                if let Some(current) = stack.last_mut() {
                    append_text(current, &String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(ProtocolError::Envelope("unexpected end of document".to_string()));
    }
    root.ok_or_else(|| ProtocolError::Envelope("empty document".to_string()))
}
