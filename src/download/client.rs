//! HTTP/HTTPS client for probing and streaming byte ranges.
//!
//! This module wraps `reqwest` behind the narrow contract the engine
//! needs: a HEAD probe that surfaces validators and the final URL after
//! redirects, and a streaming ranged GET whose body the worker drains
//! chunk by chunk. Aborting a transfer is dropping the stream.
//!
//! Redirects (301/302/307/308) are followed natively up to the
//! configured cap; exceeding the cap surfaces as a redirect-storm error.
//! A 301/302 on a non-GET request switches to GET and drops the body,
//! per protocol.

use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH,
    CONTENT_TYPE, COOKIE, ETAG, LAST_MODIFIED, RANGE, REFERER, RETRY_AFTER, USER_AGENT,
};
use reqwest::redirect::Policy;
use reqwest::{Method, StatusCode};
use tracing::{debug, instrument, warn};

use super::error::DownloadError;
use super::filename::parse_content_disposition;

/// Streaming response body; each item is one received chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, DownloadError>> + Send>>;

/// Proxy for one request: `host:port` or a full proxy URL, with optional
/// credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Proxy address (`host:port`, or `http://host:port`, or a SOCKS URL).
    pub address: String,
    /// Proxy username; empty = no proxy auth.
    pub username: String,
    /// Proxy password.
    pub password: String,
}

/// Request method accepted by the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMethod {
    /// Plain GET (the streaming path).
    #[default]
    Get,
    /// HEAD probe.
    Head,
    /// POST with a body; redirects may demote it to GET.
    Post,
}

/// Per-request configuration: URL, decoration, range, and transport
/// behavior.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// Target URL.
    pub url: String,
    /// Request method.
    pub method: RequestMethod,
    /// Referer header; empty = omitted.
    pub referrer: String,
    /// User-Agent header; empty = omitted.
    pub user_agent: String,
    /// Cookie header value; empty = omitted.
    pub cookies: String,
    /// POST body (used when `method` is POST).
    pub post_data: String,
    /// Basic-auth username; empty = no auth.
    pub username: String,
    /// Basic-auth password.
    pub password: String,
    /// Additional headers applied verbatim.
    pub custom_headers: Vec<(String, String)>,
    /// First byte of the requested range; -1 = no range.
    pub range_start: i64,
    /// Last byte, inclusive; -1 = open-ended (`bytes=<start>-`).
    pub range_end: i64,
    /// Proxy for this request.
    pub proxy: Option<ProxyConfig>,
    /// Redirect cap.
    pub max_redirects: usize,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Receive timeout: the longest tolerated gap between body chunks.
    pub receive_timeout: Duration,
    /// Verify TLS certificates.
    pub verify_tls: bool,
}

impl RequestConfig {
    /// A GET request for a URL with default transport behavior.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: RequestMethod::Get,
            referrer: String::new(),
            user_agent: String::new(),
            cookies: String::new(),
            post_data: String::new(),
            username: String::new(),
            password: String::new(),
            custom_headers: Vec::new(),
            range_start: -1,
            range_end: -1,
            proxy: None,
            max_redirects: 10,
            connect_timeout: Duration::from_secs(30),
            receive_timeout: Duration::from_secs(60),
            verify_tls: true,
        }
    }

    /// The Range header value for this request, if a range is set:
    /// `bytes=<start>-` when the end is open, else `bytes=<start>-<end>`.
    #[must_use]
    pub fn range_header(&self) -> Option<String> {
        if self.range_start < 0 {
            return None;
        }
        if self.range_end < 0 {
            Some(format!("bytes={}-", self.range_start))
        } else {
            Some(format!("bytes={}-{}", self.range_start, self.range_end))
        }
    }
}

/// Response metadata extracted from the headers.
#[derive(Debug, Clone)]
pub struct ResponseInfo {
    /// HTTP status code.
    pub status: u16,
    /// Decoded Content-Length; -1 = unknown.
    pub content_length: i64,
    /// Content-Type value.
    pub content_type: String,
    /// Filename parsed from Content-Disposition, if present.
    pub disposition_filename: Option<String>,
    /// Server advertises byte-range support.
    pub accept_ranges: bool,
    /// ETag validator.
    pub etag: String,
    /// Last-Modified validator.
    pub last_modified: String,
    /// URL after all redirects.
    pub final_url: String,
}

/// Fingerprint of the client-level settings; a new `reqwest::Client` is
/// only built when these change between requests.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ClientKey {
    max_redirects: usize,
    connect_timeout: Duration,
    receive_timeout: Duration,
    verify_tls: bool,
    proxy: Option<ProxyConfig>,
}

/// HTTP client instance.
///
/// Designed to be pooled and reused: consecutive requests with the same
/// transport settings (the normal case, since every request of one
/// download shares them) reuse the same underlying connection pool.
#[derive(Debug, Default)]
pub struct HttpClient {
    cached: Mutex<Option<(ClientKey, reqwest::Client)>>,
}

impl HttpClient {
    /// Creates a fresh client with no warm connections.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Performs a HEAD request and reports the response metadata.
    ///
    /// The status code is reported, not judged: callers decide what a
    /// 4xx/5xx means for them.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for transport failures, timeouts, and
    /// redirect storms.
    #[instrument(skip(self, config), fields(url = %config.url))]
    pub async fn head(&self, config: &RequestConfig) -> Result<ResponseInfo, DownloadError> {
        let client = self.client_for(config)?;
        let request = self.build_request(&client, config, RequestMethod::Head)?;

        let response = request
            .send()
            .await
            .map_err(|e| map_reqwest_error(&config.url, e))?;

        let info = extract_info(&response);
        debug!(
            status = info.status,
            content_length = info.content_length,
            accept_ranges = info.accept_ranges,
            "probe complete"
        );
        Ok(info)
    }

    /// Performs a streaming GET (or POST) and hands back the chunk
    /// stream alongside the response metadata.
    ///
    /// A ranged request answered with 200 instead of 206 means the
    /// server ignored the range; that is an error for any non-zero
    /// start offset because the body would be the whole file.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::HttpStatus`] for 4xx/5xx responses
    /// (carrying the Retry-After value when present) and transport
    /// errors as for [`head`](Self::head).
    #[instrument(skip(self, config), fields(url = %config.url, range_start = config.range_start))]
    pub async fn get(
        &self,
        config: &RequestConfig,
    ) -> Result<(ResponseInfo, ByteStream), DownloadError> {
        let client = self.client_for(config)?;
        let request = self.build_request(&client, config, config.method)?;

        let response = request
            .send()
            .await
            .map_err(|e| map_reqwest_error(&config.url, e))?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(DownloadError::http_status_with_retry_after(
                &config.url,
                status.as_u16(),
                retry_after,
            ));
        }

        if config.range_start > 0 && status != StatusCode::PARTIAL_CONTENT {
            warn!(status = status.as_u16(), "server ignored range request");
            return Err(DownloadError::RangeNotHonored {
                url: config.url.clone(),
                status: status.as_u16(),
            });
        }

        let info = extract_info(&response);
        let url = config.url.clone();
        let stream = response
            .bytes_stream()
            .map_err(move |e| map_reqwest_error(&url, e))
            .boxed();

        Ok((info, stream))
    }

    /// Returns a `reqwest::Client` matching the request's transport
    /// settings, reusing the cached one when the settings are unchanged.
    fn client_for(&self, config: &RequestConfig) -> Result<reqwest::Client, DownloadError> {
        let key = ClientKey {
            max_redirects: config.max_redirects,
            connect_timeout: config.connect_timeout,
            receive_timeout: config.receive_timeout,
            verify_tls: config.verify_tls,
            proxy: config.proxy.clone(),
        };

        {
            let cached = self.lock_cache();
            if let Some((cached_key, client)) = cached.as_ref() {
                if *cached_key == key {
                    return Ok(client.clone());
                }
            }
        }

        let mut builder = reqwest::Client::builder()
            .redirect(Policy::limited(key.max_redirects))
            .connect_timeout(key.connect_timeout)
            .read_timeout(key.receive_timeout)
            .danger_accept_invalid_certs(!key.verify_tls);

        if let Some(proxy) = &key.proxy {
            let address = if proxy.address.contains("://") {
                proxy.address.clone()
            } else {
                format!("http://{}", proxy.address)
            };
            let mut reqwest_proxy = reqwest::Proxy::all(&address)
                .map_err(|_| DownloadError::invalid_url(&proxy.address))?;
            if !proxy.username.is_empty() {
                reqwest_proxy = reqwest_proxy.basic_auth(&proxy.username, &proxy.password);
            }
            builder = builder.proxy(reqwest_proxy);
        }

        let client = builder
            .build()
            .map_err(|e| map_reqwest_error(&config.url, e))?;

        *self.lock_cache() = Some((key, client.clone()));
        Ok(client)
    }

    /// Assembles the request with all decoration applied.
    fn build_request(
        &self,
        client: &reqwest::Client,
        config: &RequestConfig,
        method: RequestMethod,
    ) -> Result<reqwest::RequestBuilder, DownloadError> {
        let method = match method {
            RequestMethod::Get => Method::GET,
            RequestMethod::Head => Method::HEAD,
            RequestMethod::Post => Method::POST,
        };

        let mut headers = HeaderMap::new();
        if !config.referrer.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&config.referrer) {
                headers.insert(REFERER, value);
            }
        }
        if !config.user_agent.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&config.user_agent) {
                headers.insert(USER_AGENT, value);
            }
        }
        if !config.cookies.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&config.cookies) {
                headers.insert(COOKIE, value);
            }
        }
        if let Some(range) = config.range_header() {
            if let Ok(value) = HeaderValue::from_str(&range) {
                headers.insert(RANGE, value);
            }
        }
        for (name, value) in &config.custom_headers {
            let parsed = (
                name.parse::<HeaderName>(),
                HeaderValue::from_str(value),
            );
            if let (Ok(name), Ok(value)) = parsed {
                headers.insert(name, value);
            } else {
                warn!(header = %name, "dropping malformed custom header");
            }
        }

        let mut request = client.request(method, &config.url).headers(headers);

        if !config.username.is_empty() {
            request = request.basic_auth(&config.username, Some(&config.password));
        }
        if config.method == RequestMethod::Post && !config.post_data.is_empty() {
            request = request.body(config.post_data.clone());
        }

        Ok(request)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, Option<(ClientKey, reqwest::Client)>> {
        match self.cached.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Pulls the contract fields out of a response.
fn extract_info(response: &reqwest::Response) -> ResponseInfo {
    let headers = response.headers();

    let header_str = |name: &HeaderName| -> String {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };

    let content_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(-1);

    let accept_ranges = headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));

    let disposition_filename = headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_disposition);

    ResponseInfo {
        status: response.status().as_u16(),
        content_length,
        content_type: header_str(&CONTENT_TYPE),
        disposition_filename,
        accept_ranges,
        etag: header_str(&ETAG),
        last_modified: header_str(&LAST_MODIFIED),
        final_url: response.url().to_string(),
    }
}

/// Maps a reqwest error into the engine's error taxonomy.
fn map_reqwest_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        return DownloadError::timeout(url);
    }
    if error.is_redirect() {
        return DownloadError::RedirectStorm {
            url: url.to_string(),
        };
    }
    if error.is_builder() {
        return DownloadError::invalid_url(url);
    }
    DownloadError::network(url, error)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== Range Header Tests ====================

    #[test]
    fn test_range_header_unset() {
        let config = RequestConfig::new("http://example.com/f");
        assert_eq!(config.range_header(), None);
    }

    #[test]
    fn test_range_header_open_ended() {
        let config = RequestConfig {
            range_start: 1024,
            ..RequestConfig::new("http://example.com/f")
        };
        assert_eq!(config.range_header(), Some("bytes=1024-".to_string()));
    }

    #[test]
    fn test_range_header_bounded_inclusive() {
        let config = RequestConfig {
            range_start: 0,
            range_end: 4095,
            ..RequestConfig::new("http://example.com/f")
        };
        assert_eq!(config.range_header(), Some("bytes=0-4095".to_string()));
    }

    // ==================== Live Request Tests ====================

    #[tokio::test]
    async fn test_head_extracts_metadata() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/file.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Accept-Ranges", "bytes")
                    .insert_header("ETag", "\"v1\"")
                    .insert_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT")
                    .insert_header("Content-Type", "application/octet-stream")
                    .set_body_bytes(vec![0u8; 4096]),
            )
            .mount(&server)
            .await;

        let client = HttpClient::new();
        let config = RequestConfig::new(format!("{}/file.bin", server.uri()));
        let info = client.head(&config).await.unwrap();

        assert_eq!(info.status, 200);
        assert_eq!(info.content_length, 4096);
        assert!(info.accept_ranges);
        assert_eq!(info.etag, "\"v1\"");
        assert_eq!(info.last_modified, "Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(info.content_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn test_head_reports_error_status_without_failing() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = HttpClient::new();
        let config = RequestConfig::new(format!("{}/gone", server.uri()));
        let info = client.head(&config).await.unwrap();
        assert_eq!(info.status, 404);
    }

    #[tokio::test]
    async fn test_get_streams_body() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let body = vec![0x42u8; 128 * 1024];
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let client = HttpClient::new();
        let config = RequestConfig::new(format!("{}/file.bin", server.uri()));
        let (info, mut stream) = client.get(&config).await.unwrap();
        assert_eq!(info.status, 200);

        let mut received = Vec::new();
        while let Some(chunk) = stream.next().await {
            received.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(received, body);
    }

    #[tokio::test]
    async fn test_get_sends_range_header() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .and(header("Range", "bytes=100-199"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(vec![1u8; 100]))
            .mount(&server)
            .await;

        let client = HttpClient::new();
        let config = RequestConfig {
            range_start: 100,
            range_end: 199,
            ..RequestConfig::new(format!("{}/file.bin", server.uri()))
        };
        let (info, _stream) = client.get(&config).await.unwrap();
        assert_eq!(info.status, 206);
    }

    #[tokio::test]
    async fn test_get_rejects_ignored_range() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8; 100]))
            .mount(&server)
            .await;

        let client = HttpClient::new();
        let config = RequestConfig {
            range_start: 100,
            range_end: 199,
            ..RequestConfig::new(format!("{}/file.bin", server.uri()))
        };
        let result = client.get(&config).await;
        assert!(matches!(
            result,
            Err(DownloadError::RangeNotHonored { status: 200, .. })
        ));
    }

    #[tokio::test]
    async fn test_get_surfaces_status_error_with_retry_after() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "17"))
            .mount(&server)
            .await;

        let client = HttpClient::new();
        let config = RequestConfig::new(format!("{}/busy", server.uri()));
        let result = client.get(&config).await;

        match result {
            Err(DownloadError::HttpStatus {
                status,
                retry_after,
                ..
            }) => {
                assert_eq!(status, 429);
                assert_eq!(retry_after.as_deref(), Some("17"));
            }
            Ok(_) => panic!("expected HttpStatus(429), got Ok"),
            Err(other) => panic!("expected HttpStatus(429), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_redirect_reports_final_url() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/old"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", "/new-location"),
            )
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/new-location"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 10]))
            .mount(&server)
            .await;

        let client = HttpClient::new();
        let config = RequestConfig::new(format!("{}/old", server.uri()));
        let info = client.head(&config).await.unwrap();

        assert_eq!(info.status, 200);
        assert!(info.final_url.ends_with("/new-location"));
    }

    #[tokio::test]
    async fn test_redirect_storm_detected() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        // /loop redirects to itself forever.
        Mock::given(method("HEAD"))
            .and(path("/loop"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/loop"))
            .mount(&server)
            .await;

        let client = HttpClient::new();
        let config = RequestConfig {
            max_redirects: 3,
            ..RequestConfig::new(format!("{}/loop", server.uri()))
        };
        let result = client.head(&config).await;
        assert!(matches!(result, Err(DownloadError::RedirectStorm { .. })));
    }

    #[tokio::test]
    async fn test_decoration_headers_sent() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file"))
            .and(header("Referer", "https://origin.example/page"))
            .and(header("User-Agent", "accel-test/1.0"))
            .and(header("Cookie", "session=abc123"))
            .and(header("X-Custom", "42"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;

        let client = HttpClient::new();
        let config = RequestConfig {
            referrer: "https://origin.example/page".to_string(),
            user_agent: "accel-test/1.0".to_string(),
            cookies: "session=abc123".to_string(),
            custom_headers: vec![("X-Custom".to_string(), "42".to_string())],
            ..RequestConfig::new(format!("{}/file", server.uri()))
        };
        let (info, _stream) = client.get(&config).await.unwrap();
        assert_eq!(info.status, 200);
    }

    #[tokio::test]
    async fn test_content_disposition_filename_extracted() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/dl"))
            .respond_with(ResponseTemplate::new(200).insert_header(
                "Content-Disposition",
                "attachment; filename*=UTF-8''nightly%20build.tar.gz",
            ))
            .mount(&server)
            .await;

        let client = HttpClient::new();
        let config = RequestConfig::new(format!("{}/dl", server.uri()));
        let info = client.head(&config).await.unwrap();
        assert_eq!(info.disposition_filename.as_deref(), Some("nightly build.tar.gz"));
    }
}
