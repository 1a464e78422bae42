//! Upstream HTTP client
//!
//! Features:
//! - Fixed identity headers (user agent, referer, origin) on every request
//! - HTTP/2 negotiated via ALPN, falling back to HTTP/1.1
//! - Brotli, Zstd, Gzip compression (auto-negotiated)
//! - Connection pooling with keep-alive
//! - Request timeout surfaced as [`RelayError::Timeout`]

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use tracing::{debug, instrument};

use crate::error::{RelayError, Result};
use crate::identity::UpstreamIdentity;

/// Default bound on a whole upstream request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A fully read upstream response.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub body: Bytes,
    pub content_type: Option<String>,
    /// Address after redirects.
    pub final_url: String,
}

/// HTTP client presenting the configured upstream identity.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
}

impl UpstreamClient {
    pub fn new(identity: &UpstreamIdentity, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            // ═══════════════════════════════════════════════════════════════
            // CONNECTIONS
            // ═══════════════════════════════════════════════════════════════
            .http2_adaptive_window(true)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .use_rustls_tls()
            // ═══════════════════════════════════════════════════════════════
            // COMPRESSION
            // ═══════════════════════════════════════════════════════════════
            .brotli(true)
            .zstd(true)
            .gzip(true)
            .deflate(true)
            // ═══════════════════════════════════════════════════════════════
            // IDENTITY
            // ═══════════════════════════════════════════════════════════════
            .default_headers(identity.to_headers()?)
            // ═══════════════════════════════════════════════════════════════
            // TIMEOUTS
            // ═══════════════════════════════════════════════════════════════
            .connect_timeout(Duration::from_secs(10).min(timeout))
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;

        Ok(Self { client })
    }

    /// Send a GET and fail on any non-2xx status.
    #[instrument(skip(self), fields(url = %url))]
    pub async fn fetch(&self, url: &str) -> Result<Response> {
        let response = self.client.get(url).send().await?;
        debug!(
            status = %response.status(),
            version = ?response.version(),
            "Upstream response received"
        );
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::UpstreamStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    /// Fetch and read the whole body.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Fetched> {
        let response = self.fetch(url).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let final_url = response.url().to_string();
        let body = response.bytes().await?;
        Ok(Fetched {
            body,
            content_type,
            final_url,
        })
    }
}
