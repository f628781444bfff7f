//! Error types for asset acquisition.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while acquiring an asset.
#[derive(Debug, Error)]
pub enum AssetError {
    /// The reference is malformed, too long, or uses a disallowed scheme.
    #[error("invalid asset reference {url}: {reason}")]
    Validation {
        /// The rejected reference.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// An attempt did not settle before its deadline.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// The response body exceeded the configured size cap.
    #[error("{url} exceeds the {limit} byte download limit")]
    TooLarge {
        /// The oversized URL.
        url: String,
        /// The configured cap in bytes.
        limit: u64,
    },

    /// The bytes are not an image format we handle.
    #[error("unsupported image format for {url} (content type: {})", content_type.as_deref().unwrap_or("none"))]
    UnsupportedFormat {
        /// The URL that was fetched.
        url: String,
        /// Declared content type, if any.
        content_type: Option<String>,
    },

    /// Decoding, resizing, or re-encoding failed.
    #[error("failed to process {url}: {reason}")]
    Processing {
        /// The URL being processed.
        url: String,
        /// What went wrong.
        reason: String,
    },

    /// The compressor refused to produce output at acceptable quality.
    #[error("compression quality too low for {url}: {reason}")]
    Quality {
        /// The URL being processed.
        url: String,
        /// Compressor detail.
        reason: String,
    },

    /// File system error while persisting the asset.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

impl AssetError {
    /// Creates a validation error.
    pub fn validation(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a size-cap error.
    pub fn too_large(url: impl Into<String>, limit: u64) -> Self {
        Self::TooLarge {
            url: url.into(),
            limit,
        }
    }

    /// Creates an unsupported-format error.
    pub fn unsupported_format(url: impl Into<String>, content_type: Option<String>) -> Self {
        Self::UnsupportedFormat {
            url: url.into(),
            content_type,
        }
    }

    /// Creates a processing error.
    pub fn processing(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Processing {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a quality error.
    pub fn quality(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Quality {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true for [`AssetError::Validation`].
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Returns true for [`AssetError::Timeout`].
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
