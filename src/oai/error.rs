//! Error types for the OAI-PMH protocol client.

use thiserror::Error;

/// Errors raised while fetching or decoding one `ListRecords` page.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    /// The source's endpoint URL cannot be parsed.
    #[error("invalid endpoint URL '{endpoint}': {message}\n  Suggestion: Check the source's endpoint_url")]
    InvalidEndpoint {
        /// Endpoint as configured
        endpoint: String,
        /// Parser message
        message: String,
    },

    /// The request never produced a response (connect, DNS, timeout, body read).
    #[error("transport error calling {endpoint}: {message}")]
    Transport {
        /// Endpoint URL
        endpoint: String,
        /// Underlying error text
        message: String,
        /// True when the failure was a timeout
        timeout: bool,
    },

    /// The endpoint answered with a non-success HTTP status.
    #[error("endpoint {endpoint} returned HTTP {status}")]
    Status {
        /// Endpoint URL
        endpoint: String,
        /// HTTP status code
        status: u16,
    },

    /// The response body is not a well-formed OAI-PMH envelope.
    #[error("malformed OAI-PMH response: {0}")]
    Envelope(String),

    /// The endpoint reported `noRecordsMatch`: nothing new for this selector.
    #[error("no records match the request")]
    NoRecordsMatch,

    /// The endpoint rejected the continuation token.
    #[error("endpoint rejected resumption token: {0}\n  Suggestion: The next harvest restarts from the last-harvested boundary")]
    BadResumptionToken(String),

    /// Any other OAI-PMH error code.
    #[error("OAI-PMH error {code}: {message}")]
    Oai {
        /// Protocol error code, e.g. `badArgument`
        code: String,
        /// Human-readable message from the endpoint
        message: String,
    },
}

impl ProtocolError {
    /// Creates a transport error from a `reqwest` failure.
    #[must_use]
    pub fn transport(endpoint: &str, error: &reqwest::Error) -> Self {
        Self::Transport {
            endpoint: endpoint.to_string(),
            message: error.to_string(),
            timeout: error.is_timeout(),
        }
    }

    /// Maps an `<error code="...">` element to a typed error.
    #[must_use]
    pub fn from_oai_code(code: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            "noRecordsMatch" => Self::NoRecordsMatch,
            "badResumptionToken" => Self::BadResumptionToken(message),
            _ => Self::Oai {
                code: code.to_string(),
                message,
            },
        }
    }

    /// Returns true when re-requesting the same page may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::InvalidEndpoint { .. }
            | Self::Envelope(_)
            | Self::NoRecordsMatch
            | Self::BadResumptionToken(_)
            | Self::Oai { .. } => false,
        }
    }
}
