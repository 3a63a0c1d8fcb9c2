//! Concrete database connectors.
//!
//! | Id | System |
//! |---|---|
//! | `local` | Records harvested into the local store |
//! | `crossref` | Crossref REST API `/works` |
//! | `openalex` | OpenAlex `/works` |

mod crossref;
mod local;
mod openalex;

pub use crossref::CrossrefConnector;
pub use local::LocalConnector;
pub use openalex::OpenAlexConnector;

use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{ConnectorError, ConnectorErrorKind, RateLimiter, parse_retry_after};

/// Most rows requested from a remote API in one call.
pub(crate) const MAX_REMOTE_ROWS: u32 = 200;

/// Issues a rate-limited GET and decodes a JSON body.
///
/// HTTP 429 records the server's `Retry-After` with the limiter and is
/// returned as a rate-limit error carrying the same hint. A host paused for
/// longer than `max_wait` fails the same way without sending a request.
pub(crate) async fn fetch_json<T: DeserializeOwned>(
    client: &Client,
    limiter: &RateLimiter,
    max_wait: Duration,
    database: &str,
    url: &str,
) -> Result<T, ConnectorError> {
    if let Err(remaining) = limiter.acquire_within(url, max_wait).await {
        return Err(ConnectorError::new(
            database,
            ConnectorErrorKind::RateLimit,
            format!("host paused for another {}s", remaining.as_secs()),
        )
        .with_retry_after(Some(remaining)));
    }
    debug!(database, url, "calling search API");

    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ConnectorError::from_reqwest(database, &e))?;
    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        if status.as_u16() == 429 {
            limiter
                .record_rate_limit(url, retry_after.unwrap_or(limiter.min_interval()))
                .await;
        }
        return Err(ConnectorError::from_status(database, status.as_u16(), retry_after));
    }

    let body = response
        .text()
        .await
        .map_err(|e| ConnectorError::from_reqwest(database, &e))?;
    serde_json::from_str(&body)
        .map_err(|e| ConnectorError::new(database, ConnectorErrorKind::Parse, e.to_string()))
}

/// Rows to request for a query window.
pub(crate) fn remote_rows(window: u32) -> u32 {
    window.clamp(1, MAX_REMOTE_ROWS)
}
