//! Origin Fetcher
//!
//! The authoritative source consulted only when every cache layer misses.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use tracing::{debug, instrument};

use crate::error::{Error, Result};

/// Content type used when the origin does not send one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Default origin base URL
pub const DEFAULT_ORIGIN_URL: &str = "https://get.taaghche.com/v2/book/";

/// Authoritative response for a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginResponse {
    pub payload: Bytes,
    pub content_type: String,
}

impl OriginResponse {
    pub fn new(payload: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            content_type: content_type.into(),
        }
    }
}

/// Produces the authoritative value for a key
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<OriginResponse>;
}

/// HTTP origin configuration
#[derive(Debug, Clone)]
pub struct HttpOriginConfig {
    /// Base URL; the key is appended as a path segment
    pub base_url: String,
    /// Whole-request timeout
    pub timeout: Duration,
}

impl Default for HttpOriginConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ORIGIN_URL.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Fetches `GET <base_url><key>` over HTTP
#[derive(Debug)]
pub struct HttpOriginFetcher {
    config: HttpOriginConfig,
    client: Client,
}

impl HttpOriginFetcher {
    /// Create a new HTTP fetcher
    pub fn new(config: HttpOriginConfig) -> Result<Self> {
        reqwest::Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("invalid origin URL '{}': {e}", config.base_url)))?;

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    /// URL requested for `key`
    pub fn url_for(&self, key: &str) -> String {
        format!("{}{}", self.config.base_url, urlencoding::encode(key))
    }
}

#[async_trait]
impl OriginFetcher for HttpOriginFetcher {
    #[instrument(skip(self))]
    async fn fetch(&self, key: &str) -> Result<OriginResponse> {
        let url = self.url_for(key);
        debug!(%url, "fetching from origin");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(Error::OriginRequest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::OriginStatus {
                status: status.as_u16(),
                url,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        let payload = response.bytes().await.map_err(Error::OriginRequest)?;

        Ok(OriginResponse {
            payload,
            content_type,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
