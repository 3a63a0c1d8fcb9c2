//! Shared HTTP client construction policy.
//!
//! The OAI-PMH client, the enrichment client, and the remote search
//! connectors all build their `reqwest::Client` here so timeouts,
//! user-agent, compression, and proxy handling stay consistent.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use reqwest::{Client, ClientBuilder, Proxy};
use thiserror::Error;
use tracing::warn;

/// Project URL for User-Agent identification (RFC 9308 good citizenship).
const PROJECT_UA_URL: &str = "https://github.com/fierce/harvester";

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default whole-request timeout.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 30;

/// Connect and read timeouts applied to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpTimeouts {
    /// TCP/TLS connect timeout.
    pub connect: Duration,
    /// Whole-request timeout.
    pub read: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            read: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
        }
    }
}

impl HttpTimeouts {
    /// Builds timeouts from whole seconds.
    #[must_use]
    pub fn from_secs(connect_secs: u64, read_secs: u64) -> Self {
        Self {
            connect: Duration::from_secs(connect_secs),
            read: Duration::from_secs(read_secs),
        }
    }
}

/// HTTP client construction failure.
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// `reqwest` rejected the configuration.
    #[error("HTTP client construction failed for {component}: {source}")]
    Build {
        /// Component that requested the client.
        component: String,
        /// Underlying builder error.
        #[source]
        source: reqwest::Error,
    },

    /// System proxy lookup panicked even with the env-proxy fallback.
    #[error("HTTP client construction panicked for {component}")]
    Panicked {
        /// Component that requested the client.
        component: String,
    },
}

/// Shared User-Agent for every outbound request.
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("harvester/{version} (metadata-harvester; +{PROJECT_UA_URL})")
}

/// Builds an HTTP client using the shared project policy.
///
/// `component` is used only in logs and error messages, never in the
/// User-Agent header.
///
/// # Errors
///
/// Returns [`HttpClientError`] when client construction fails.
pub fn build_http_client(component: &str, timeouts: HttpTimeouts) -> Result<Client, HttpClientError> {
    let user_agent = default_user_agent();
    match try_build_client(&user_agent, timeouts, false) {
        Ok(client) => Ok(client),
        Err(BuildClientFailure::Panic) => {
            // Some sandboxed environments panic when querying system proxy
            // settings; retry with env proxies only.
            warn!(
                component,
                "HTTP client hit system proxy panic; using env-proxy fallback builder"
            );
            try_build_client(&user_agent, timeouts, true).map_err(|failure| match failure {
                BuildClientFailure::Panic => HttpClientError::Panicked {
                    component: component.to_string(),
                },
                BuildClientFailure::Build(source) => HttpClientError::Build {
                    component: component.to_string(),
                    source,
                },
            })
        }
        Err(BuildClientFailure::Build(source)) => Err(HttpClientError::Build {
            component: component.to_string(),
            source,
        }),
    }
}

enum BuildClientFailure {
    Panic,
    Build(reqwest::Error),
}

fn try_build_client(
    user_agent: &str,
    timeouts: HttpTimeouts,
    disable_system_proxy_lookup: bool,
) -> Result<Client, BuildClientFailure> {
    let user_agent = user_agent.to_string();
    catch_unwind(AssertUnwindSafe(move || {
        let mut builder = base_builder(user_agent, timeouts);
        if disable_system_proxy_lookup {
            builder = apply_env_proxy_fallback(builder.no_proxy());
        }
        builder.build().map_err(BuildClientFailure::Build)
    }))
    .map_err(|_| BuildClientFailure::Panic)?
}

fn base_builder(user_agent: String, timeouts: HttpTimeouts) -> ClientBuilder {
    Client::builder()
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.read)
        .user_agent(user_agent)
        .gzip(true)
}

fn apply_env_proxy_fallback(mut builder: ClientBuilder) -> ClientBuilder {
    if let Some(proxy) = env_proxy_for_scheme("https")
        && let Ok(resolved) = Proxy::https(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    if let Some(proxy) = env_proxy_for_scheme("http")
        && let Ok(resolved) = Proxy::http(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    builder
}

fn env_proxy_for_scheme(scheme: &str) -> Option<String> {
    let names: &[&str] = match scheme {
        "https" => &["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"],
        "http" => &["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"],
        _ => return None,
    };
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}
