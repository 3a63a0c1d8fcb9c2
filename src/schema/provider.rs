//! Provider inference from record URLs.

use url::Url;

/// Known hosting domains and the provider name they map to.
///
/// Matched as a domain suffix, so `www.jstor.org` and `stable.jstor.org`
/// both map to `jstor`.
const KNOWN_PROVIDERS: &[(&str, &str)] = &[
    ("jstor.org", "jstor"),
    ("proquest.com", "proquest"),
    ("ebscohost.com", "ebsco"),
    ("sciencedirect.com", "elsevier"),
    ("elsevier.com", "elsevier"),
    ("springer.com", "springer"),
    ("nature.com", "springer"),
    ("wiley.com", "wiley"),
    ("tandfonline.com", "taylor_francis"),
    ("muse.jhu.edu", "project_muse"),
    ("cambridge.org", "cambridge"),
    ("oup.com", "oxford"),
    ("sagepub.com", "sage"),
    ("ieeexplore.ieee.org", "ieee"),
    ("arxiv.org", "arxiv"),
    ("ncbi.nlm.nih.gov", "pubmed"),
    ("doi.org", "doi"),
];

/// Normalizes a host string: trim, lowercase, strip leading `www.` and trailing `.`.
#[must_use]
pub fn canonical_host(host: &str) -> String {
    host.trim()
        .to_ascii_lowercase()
        .trim_start_matches("www.")
        .trim_end_matches('.')
        .to_string()
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Infers a provider name from a record URL.
///
/// Known hosting platforms map to their provider name; any other host maps
/// to its registrable label (`repository.example.edu` becomes `example`).
/// `doi.org` links say nothing about the provider and return `None`.
///
/// # Examples
///
/// ```
/// use harvester_core::schema::infer_provider;
///
/// assert_eq!(infer_provider("https://www.jstor.org/stable/123").as_deref(), Some("jstor"));
/// assert_eq!(infer_provider("https://repo.example.edu/x").as_deref(), Some("example"));
/// assert_eq!(infer_provider("not a url"), None);
/// ```
#[must_use]
pub fn infer_provider(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = canonical_host(parsed.host_str()?);

    if let Some((_, provider)) = KNOWN_PROVIDERS
        .iter()
        .find(|(domain, _)| host_matches(&host, domain))
    {
        return (*provider != "doi").then(|| (*provider).to_string());
    }

    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    match labels.as_slice() {
        [] => None,
        [single] => Some((*single).to_string()),
        [.., name, _tld] => Some((*name).to_string()),
    }
}
