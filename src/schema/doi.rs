//! DOI detection and normalization inside metadata identifier fields.

use std::sync::LazyLock;

use regex::Regex;
use tracing::trace;

/// Regex pattern for DOIs: `10.XXXX/suffix`, nested registrants included.
#[allow(clippy::expect_used)]
static DOI_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"10\.\d{4,9}(?:\.\d+)*/[^\s<>"'\]]+"#).expect("DOI regex is valid") // Static pattern, safe to panic
});

/// Finds the first DOI in `text` and returns it normalized.
///
/// Accepts bare DOIs, `doi:` prefixes, and `doi.org` URLs. The result is
/// lowercased (DOIs are case-insensitive) with trailing punctuation and
/// unbalanced closing brackets removed.
///
/// # Examples
///
/// ```
/// use harvester_core::schema::find_doi;
///
/// assert_eq!(find_doi("https://doi.org/10.1234/ABC."), Some("10.1234/abc".to_string()));
/// assert_eq!(find_doi("urn:isbn:123"), None);
/// ```
#[must_use]
pub fn find_doi(text: &str) -> Option<String> {
    let decoded = urlencoding::decode(text)
        .map(|d| d.into_owned())
        .unwrap_or_else(|_| text.to_string());

    DOI_PATTERN.find_iter(&decoded).find_map(|m| {
        // Reject IP-like and version-like matches (`192.10.1234/24`, `v10.1234/x`).
        if m.start() > 0 {
            let prev = decoded.as_bytes()[m.start() - 1];
            if prev.is_ascii_alphanumeric() || prev == b'.' {
                return None;
            }
        }
        let cleaned = clean_trailing(m.as_str());
        trace!(raw = m.as_str(), doi = %cleaned, "found DOI");
        (!cleaned.ends_with('/')).then(|| cleaned.to_ascii_lowercase())
    })
}

fn clean_trailing(doi: &str) -> String {
    let mut result = doi.trim_end_matches(['.', ',', ';', ':']).to_string();
    if let Some(slash) = result.find('/') {
        for (open, close) in [('(', ')'), ('{', '}'), ('[', ']')] {
            while result.ends_with(close) && {
                let suffix = &result[slash + 1..];
                suffix.chars().filter(|&c| c == close).count()
                    > suffix.chars().filter(|&c| c == open).count()
            } {
                result.pop();
            }
        }
    }
    result
}
