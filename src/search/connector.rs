//! Connector contract, error taxonomy, and retry helper.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::http::HttpTimeouts;

use super::{SearchQuery, SearchResult};

/// Category of a connector failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorErrorKind {
    /// Credentials missing or rejected.
    Auth,
    /// The upstream API throttled the request.
    RateLimit,
    /// The request timed out.
    Timeout,
    /// The response could not be decoded.
    Parse,
    /// Connection failure or upstream 5xx.
    Network,
    /// Anything else.
    Unknown,
}

impl ConnectorErrorKind {
    /// Returns the snake_case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Parse => "parse",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }

    /// Only rate limits, timeouts, and network failures are retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit | Self::Timeout | Self::Network)
    }
}

impl fmt::Display for ConnectorErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed connector call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{database}: {kind} error: {message}")]
pub struct ConnectorError {
    /// Connector id.
    pub database: String,
    /// Category.
    pub kind: ConnectorErrorKind,
    /// Detail.
    pub message: String,
    /// Server-requested wait before retrying, if any.
    pub retry_after: Option<Duration>,
}

impl ConnectorError {
    /// Creates an error without a retry hint.
    #[must_use]
    pub fn new(database: &str, kind: ConnectorErrorKind, message: impl Into<String>) -> Self {
        Self {
            database: database.to_string(),
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Attaches a server-requested wait.
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Classifies a `reqwest` failure.
    #[must_use]
    pub fn from_reqwest(database: &str, error: &reqwest::Error) -> Self {
        let kind = if error.is_timeout() {
            ConnectorErrorKind::Timeout
        } else if error.is_decode() {
            ConnectorErrorKind::Parse
        } else if error.is_connect() || error.is_request() || error.is_body() {
            ConnectorErrorKind::Network
        } else {
            ConnectorErrorKind::Unknown
        };
        Self::new(database, kind, error.to_string())
    }

    /// Classifies a non-success HTTP status.
    #[must_use]
    pub fn from_status(database: &str, status: u16, retry_after: Option<Duration>) -> Self {
        let kind = match status {
            401 | 403 => ConnectorErrorKind::Auth,
            429 => ConnectorErrorKind::RateLimit,
            408 | 504 => ConnectorErrorKind::Timeout,
            500..=599 => ConnectorErrorKind::Network,
            _ => ConnectorErrorKind::Unknown,
        };
        Self::new(database, kind, format!("HTTP {status}")).with_retry_after(retry_after)
    }

    /// Returns true when the call may succeed if repeated.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Per-connector settings; the `[connectors.<id>]` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectorConfig {
    /// Whether the connector takes part in searches.
    pub enabled: bool,
    /// API base URL override.
    pub base_url: Option<String>,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base backoff in milliseconds; doubled per attempt.
    pub backoff_ms: u64,
    /// Minimum spacing between requests in milliseconds.
    pub rate_limit_ms: u64,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Users allowed to search this database; absent means everyone.
    pub allowed_users: Option<Vec<String>>,
    /// API key, for connectors that use one.
    pub api_key: Option<String>,
    /// Contact address for polite-pool APIs.
    pub mailto: Option<String>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            max_retries: 2,
            backoff_ms: 500,
            rate_limit_ms: 100,
            timeout_secs: 15,
            allowed_users: None,
            api_key: None,
            mailto: None,
        }
    }
}

impl ConnectorConfig {
    /// Base backoff.
    #[must_use]
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Minimum spacing between requests.
    #[must_use]
    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }

    /// Longest pause one search sits through for a server rate limit.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// HTTP timeouts derived from `timeout_secs`.
    #[must_use]
    pub fn timeouts(&self) -> HttpTimeouts {
        HttpTimeouts::from_secs(self.timeout_secs.min(10), self.timeout_secs)
    }

    /// Whether `user_id` may search this database.
    #[must_use]
    pub fn allows(&self, user_id: Option<&str>) -> bool {
        match (&self.allowed_users, user_id) {
            (None, _) => true,
            (Some(users), Some(user)) => users.iter().any(|u| u == user),
            (Some(_), None) => false,
        }
    }
}

/// One searchable external system.
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    /// Stable id used in filters, cache keys, and error reports.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str;

    /// Whether the connector is switched on.
    fn is_enabled(&self) -> bool;

    /// Whether `user_id` may search this database.
    async fn validate_access(&self, user_id: Option<&str>) -> bool;

    /// Establishes or checks credentials.
    async fn authenticate(&self) -> Result<(), ConnectorError>;

    /// Most hits one call can return, whatever window is asked for.
    fn max_results(&self) -> u32 {
        u32::MAX
    }

    /// Returns up to `query.page * query.limit` hits for `query`, best first,
    /// and never more than [`max_results`](Self::max_results).
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, ConnectorError>;
}

/// Runs `operation`, retrying retryable failures with exponential backoff.
///
/// Attempt `n` (0-indexed) that fails with a retryable error waits
/// `backoff * 2^n`, or the error's `retry_after` when the server sent one,
/// before the next attempt. Non-retryable errors return immediately, and so
/// does any failure whose wait would exceed `max_wait`.
///
/// # Errors
///
/// Returns the last error once retries are exhausted, the first
/// non-retryable error, or the error whose wait is over `max_wait`.
pub async fn with_retry<T, F, Fut>(
    max_retries: u32,
    backoff: Duration,
    max_wait: Duration,
    mut operation: F,
) -> Result<T, ConnectorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectorError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < max_retries => {
                let delay = error
                    .retry_after
                    .unwrap_or_else(|| backoff.saturating_mul(2u32.saturating_pow(attempt)));
                if delay > max_wait {
                    warn!(
                        database = %error.database,
                        kind = %error.kind,
                        delay_secs = delay.as_secs(),
                        max_wait_secs = max_wait.as_secs(),
                        "requested wait exceeds budget; giving up"
                    );
                    return Err(error);
                }
                warn!(
                    database = %error.database,
                    kind = %error.kind,
                    attempt,
                    delay_ms = delay.as_millis(),
                    "connector call failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => {
                debug!(database = %error.database, kind = %error.kind, attempt, "connector call failed");
                return Err(error);
            }
        }
    }
}
