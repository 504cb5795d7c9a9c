//! Protocol seam between the engine and its clients.
//!
//! The orchestrator and workers only ever talk to a [`Transport`]; the
//! scheme of the URL decides whether an HTTP or FTP client sits behind
//! it. This keeps the probe and fetch paths protocol-agnostic and lets
//! tests substitute either side.

use async_trait::async_trait;

use super::client::{ByteStream, HttpClient, RequestConfig, ResponseInfo};
use super::error::DownloadError;
use super::ftp::FtpClient;

/// URL scheme family the engine can transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// `http://` or `https://`.
    Http,
    /// `ftp://`.
    Ftp,
}

impl Scheme {
    /// Classifies a URL by scheme.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::InvalidUrl`] for anything the engine
    /// cannot transfer.
    pub fn of(url: &str) -> Result<Self, DownloadError> {
        let lowered = url.trim_start().to_ascii_lowercase();
        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            Ok(Self::Http)
        } else if lowered.starts_with("ftp://") {
            Ok(Self::Ftp)
        } else {
            Err(DownloadError::invalid_url(url))
        }
    }
}

/// A protocol client capable of probing and streaming a resource.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issues the probe (HEAD or equivalent) for a resource.
    async fn probe(&self, config: &RequestConfig) -> Result<ResponseInfo, DownloadError>;

    /// Starts a (ranged) retrieval and returns the chunk stream.
    async fn fetch(&self, config: &RequestConfig)
        -> Result<(ResponseInfo, ByteStream), DownloadError>;
}

#[async_trait]
impl Transport for HttpClient {
    async fn probe(&self, config: &RequestConfig) -> Result<ResponseInfo, DownloadError> {
        self.head(config).await
    }

    async fn fetch(
        &self,
        config: &RequestConfig,
    ) -> Result<(ResponseInfo, ByteStream), DownloadError> {
        self.get(config).await
    }
}

#[async_trait]
impl Transport for FtpClient {
    async fn probe(&self, config: &RequestConfig) -> Result<ResponseInfo, DownloadError> {
        FtpClient::probe(self, config).await
    }

    async fn fetch(
        &self,
        config: &RequestConfig,
    ) -> Result<(ResponseInfo, ByteStream), DownloadError> {
        self.get(config).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_classification() {
        assert_eq!(Scheme::of("http://example.com/f").unwrap(), Scheme::Http);
        assert_eq!(Scheme::of("HTTPS://example.com/f").unwrap(), Scheme::Http);
        assert_eq!(Scheme::of("ftp://example.com/f").unwrap(), Scheme::Ftp);
    }

    #[test]
    fn test_unsupported_schemes_rejected() {
        assert!(Scheme::of("file:///etc/passwd").is_err());
        assert!(Scheme::of("magnet:?xt=urn:btih:abc").is_err());
        assert!(Scheme::of("example.com/f").is_err());
    }
}
