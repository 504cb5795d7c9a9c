//! Error types for the download module.
//!
//! This module defines structured errors for all transfer operations,
//! providing context-rich error messages for retry classification and
//! user feedback.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during file transfers.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion, or the body stalled longer
    /// than the receive timeout.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present.
        retry_after: Option<String>,
    },

    /// More redirect hops than the configured cap.
    #[error("redirect limit exceeded downloading {url}")]
    RedirectStorm {
        /// The URL whose redirect chain never terminated.
        url: String,
    },

    /// The server answered a ranged request without honoring the range.
    #[error("server ignored range request for {url} (expected 206, got {status})")]
    RangeNotHonored {
        /// The URL of the ranged request.
        url: String,
        /// The status actually returned.
        status: u16,
    },

    /// The body ended before the requested range was fully delivered.
    #[error("connection closed early downloading {url}: got {received} of {expected} bytes")]
    Incomplete {
        /// The URL whose body ended early.
        url: String,
        /// Bytes expected for the range.
        expected: i64,
        /// Bytes actually received.
        received: i64,
    },

    /// FTP protocol failure (unexpected reply, refused login, missing file).
    #[error("FTP error on {url}: {detail}")]
    Ftp {
        /// The FTP URL involved.
        url: String,
        /// Server reply or failure description.
        detail: String,
    },

    /// File system error during transfer (open, positioned write, rename).
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or uses an unsupported scheme.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The transfer was cancelled or paused by the user. Not a failure;
    /// the worker maps this to a clean exit.
    #[error("transfer cancelled")]
    Cancelled,
}

impl DownloadError {
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

    /// Creates an HTTP status error carrying a Retry-After header value.
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

    /// Creates an FTP protocol error.
    pub fn ftp(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Ftp {
            url: url.into(),
            detail: detail.into(),
        }
    }

    /// Creates an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }
}

// No blanket `From<reqwest::Error>` / `From<std::io::Error>` impls: the
// variants require context (url, path) that the source errors do not
// carry, so callers go through the constructors above.
