//! HTTP implementation of [`OaiProtocol`].

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};

use crate::http::{HttpClientError, HttpTimeouts, build_http_client};

use super::{ListPage, ListRequest, OaiProtocol, ProtocolError, decode_list_records};

/// OAI-PMH client over a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct OaiClient {
    client: Client,
}

impl OaiClient {
    /// Creates a client with the given timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`HttpClientError`] if HTTP client construction fails.
    pub fn new(timeouts: HttpTimeouts) -> Result<Self, HttpClientError> {
        Ok(Self {
            client: build_http_client("oai", timeouts)?,
        })
    }
}

#[async_trait]
impl OaiProtocol for OaiClient {
    #[instrument(skip(self, request), fields(endpoint = %endpoint, resumed = request.resumption_token.is_some()))]
    async fn list_page(&self, endpoint: &str, request: &ListRequest) -> Result<ListPage, ProtocolError> {
        let url = url::Url::parse_with_params(endpoint, request.query_pairs()).map_err(|e| {
            ProtocolError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            }
        })?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProtocolError::transport(endpoint, &e))?;

        let status = response.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "endpoint returned non-success status");
            return Err(ProtocolError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProtocolError::transport(endpoint, &e))?;
        debug!(bytes = body.len(), "fetched ListRecords page");
        decode_list_records(&body)
    }
}
