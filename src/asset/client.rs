//! HTTP client wrapper for fetching asset bytes.
//!
//! Assets are small enough to hold in memory, so the body is streamed into a
//! buffer with a hard size cap rather than written to disk directly.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use tracing::{debug, instrument};

use super::AssetError;
use crate::user_agent;

/// Default HTTP connect timeout (10 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default whole-request timeout (60 seconds).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Default response size cap (25 MiB).
pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 25 * 1024 * 1024;

/// Bytes and declared type of a fetched asset.
#[derive(Debug, Clone)]
pub struct FetchedAsset {
    /// Response body.
    pub bytes: Vec<u8>,
    /// `Content-Type` header value without parameters, if present.
    pub content_type: Option<String>,
}

/// HTTP client for fetching assets.
///
/// Create once and share; clones reuse the same connection pool.
///
/// # Example
///
/// ```no_run
/// use imgsync_core::asset::HttpClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new();
/// let asset = client.fetch("https://example.com/logo.png").await?;
/// println!("{} bytes", asset.bytes.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    max_bytes: u64,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a client with default timeouts and size cap.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Self::with_limits(
            DEFAULT_CONNECT_TIMEOUT,
            DEFAULT_READ_TIMEOUT,
            DEFAULT_MAX_DOWNLOAD_BYTES,
        )
        .expect("failed to build HTTP client with static configuration")
    }

    /// Creates a client with explicit timeouts and size cap.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the TLS backend cannot be initialized.
    pub fn with_limits(
        connect_timeout: Duration,
        read_timeout: Duration,
        max_bytes: u64,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .gzip(true)
            .user_agent(user_agent::default_user_agent())
            .build()?;
        Ok(Self { client, max_bytes })
    }

    /// Returns the response size cap in bytes.
    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Fetches `url` into memory.
    ///
    /// # Errors
    ///
    /// Returns [`AssetError`] if:
    /// - The request fails (network error, timeout)
    /// - The server returns an error status (4xx, 5xx); `Retry-After` is kept
    /// - The body exceeds the size cap
    #[instrument(skip(self), fields(url = %url))]
    pub async fn fetch(&self, url: &str) -> Result<FetchedAsset, AssetError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| map_request_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(std::string::ToString::to_string);
            return Err(AssetError::http_status_with_retry_after(
                url,
                status.as_u16(),
                retry_after,
            ));
        }

        if let Some(length) = response.content_length()
            && length > self.max_bytes
        {
            return Err(AssetError::too_large(url, self.max_bytes));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty());

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_request_error(url, e))?;
            if bytes.len() as u64 + chunk.len() as u64 > self.max_bytes {
                return Err(AssetError::too_large(url, self.max_bytes));
            }
            bytes.extend_from_slice(&chunk);
        }

        debug!(
            bytes = bytes.len(),
            content_type = content_type.as_deref().unwrap_or("none"),
            "asset fetched"
        );
        Ok(FetchedAsset {
            bytes,
            content_type,
        })
    }
}

fn map_request_error(url: &str, error: reqwest::Error) -> AssetError {
    if error.is_timeout() {
        AssetError::timeout(url)
    } else {
        AssetError::network(url, error)
    }
}
