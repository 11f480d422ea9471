//! Request dispatch to the network.
//!
//! A [`Fetcher`] resolves to a fully buffered response for anything the
//! server answered, whatever the status. Only transport-level failures
//! (unreachable host, DNS, timeout) are errors.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::cache::entry::StoredResponse;
use crate::router::request::InterceptedRequest;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Network unreachable: {0}")]
    Unreachable(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout(e.to_string())
        } else if e.is_builder() {
            FetchError::InvalidRequest(e.to_string())
        } else {
            FetchError::Unreachable(e.to_string())
        }
    }
}

/// The host's fetch capability.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &InterceptedRequest) -> Result<StoredResponse, FetchError>;
}

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Fetcher backed by a `reqwest` client. Redirects are returned to the
/// caller rather than followed.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &InterceptedRequest) -> Result<StoredResponse, FetchError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;

        let mut builder = self.client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        debug!(
            request_id = %request.id,
            url = %request.url,
            status,
            size = body.len(),
            "Network fetch complete"
        );

        Ok(StoredResponse::new(status, headers, body))
    }
}
