//! Crossref REST API response types and normalization.
//!
//! Shared by the enrichment client (`/works/{doi}`) and the Crossref search
//! connector (`/works?query=...`).

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::record::{Author, RecordFields};

/// Default Crossref API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.crossref.org";

#[allow(clippy::expect_used)]
static MARKUP_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("markup regex is valid")); // Static pattern, safe to panic

/// Envelope of a single-work response.
#[derive(Debug, Deserialize)]
pub(crate) struct CrossrefWorkResponse {
    pub status: String,
    pub message: CrossrefWork,
}

/// Envelope of a work-list (search) response.
#[derive(Debug, Deserialize)]
pub(crate) struct CrossrefListResponse {
    pub status: String,
    pub message: CrossrefList,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct CrossrefList {
    #[serde(default)]
    pub items: Vec<CrossrefWork>,
    #[serde(default)]
    pub total_results: Option<u64>,
}

/// One work record.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct CrossrefWork {
    #[serde(rename = "DOI")]
    pub doi: Option<String>,
    #[serde(rename = "URL")]
    pub url: Option<String>,
    pub title: Option<Vec<String>>,
    pub author: Option<Vec<CrossrefAuthor>>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub container_title: Option<Vec<String>>,
    pub publisher: Option<String>,
    pub subject: Option<Vec<String>>,
    pub license: Option<Vec<CrossrefLicense>>,
    pub published: Option<CrossrefDate>,
    pub published_print: Option<CrossrefDate>,
    pub published_online: Option<CrossrefDate>,
    pub issued: Option<CrossrefDate>,
    #[serde(rename = "type")]
    pub work_type: Option<String>,
}

/// An author entry.
#[derive(Debug, Deserialize)]
pub(crate) struct CrossrefAuthor {
    pub given: Option<String>,
    pub family: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "ORCID")]
    pub orcid: Option<String>,
    #[serde(default)]
    pub affiliation: Vec<CrossrefAffiliation>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CrossrefAffiliation {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CrossrefLicense {
    #[serde(rename = "URL")]
    pub url: Option<String>,
}

/// A date entry; `date-parts` is `[[year, month?, day?]]`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct CrossrefDate {
    pub date_parts: Option<Vec<Vec<Option<i32>>>>,
}

impl CrossrefDate {
    /// Formats the first date-parts entry as `YYYY[-MM[-DD]]`.
    fn to_normalized(&self) -> Option<String> {
        let parts = self.date_parts.as_ref()?.first()?;
        let mut iter = parts.iter().map(|p| p.filter(|v| *v > 0));
        let year = iter.next().flatten()?;
        let month = iter.next().flatten();
        let day = month.and(iter.next().flatten());
        Some(match (month, day) {
            (Some(m), Some(d)) => format!("{year:04}-{m:02}-{d:02}"),
            (Some(m), None) => format!("{year:04}-{m:02}"),
            _ => format!("{year:04}"),
        })
    }
}

impl CrossrefAuthor {
    fn to_author(&self) -> Option<Author> {
        let name = match (&self.family, &self.given) {
            (Some(f), Some(g)) => format!("{f}, {g}"),
            (Some(f), None) => f.clone(),
            (None, Some(g)) => g.clone(),
            (None, None) => self.name.clone()?,
        };
        Some(Author {
            name,
            identifier: self.orcid.clone(),
            affiliation: self.affiliation.iter().find_map(|a| a.name.clone()),
        })
    }
}

fn strip_markup(text: &str) -> String {
    MARKUP_TAG
        .replace_all(text, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

impl CrossrefWork {
    /// Publication date: `published`, then print, online, issued.
    pub(crate) fn publication_date(&self) -> Option<String> {
        [
            &self.published,
            &self.published_print,
            &self.published_online,
            &self.issued,
        ]
        .into_iter()
        .find_map(|d| d.as_ref().and_then(CrossrefDate::to_normalized))
    }

    /// Open access when any license is a Creative Commons license.
    pub(crate) fn open_access(&self) -> Option<bool> {
        let licenses = self.license.as_ref()?;
        Some(
            licenses
                .iter()
                .filter_map(|l| l.url.as_deref())
                .any(|u| u.contains("creativecommons.org")),
        )
    }

    /// Maps the work onto mergeable record fields.
    pub(crate) fn to_fields(&self) -> RecordFields {
        let mut fields = RecordFields {
            title: self
                .title
                .as_ref()
                .and_then(|t| t.first())
                .map(|t| strip_markup(t)),
            authors: self
                .author
                .as_deref()
                .unwrap_or_default()
                .iter()
                .filter_map(CrossrefAuthor::to_author)
                .collect(),
            abstract_text: self
                .abstract_text
                .as_deref()
                .map(strip_markup)
                .filter(|a| !a.is_empty()),
            publication_date: self.publication_date(),
            journal: self.container_title.as_ref().and_then(|c| c.first()).cloned(),
            url: self.url.clone(),
            doi: self.doi.as_ref().map(|d| d.to_ascii_lowercase()),
            keywords: self.subject.clone().unwrap_or_default(),
            open_access: self.open_access(),
            ..RecordFields::default()
        };
        if let Some(publisher) = &self.publisher {
            fields
                .extra
                .insert("publisher".to_string(), Value::String(publisher.clone()));
        }
        if let Some(work_type) = &self.work_type {
            fields
                .extra
                .insert("type".to_string(), Value::String(work_type.clone()));
        }
        fields
    }
}
