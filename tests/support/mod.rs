//! Shared helpers for the engine integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use accel::EngineConfig;

/// A range-aware file server: full body on plain GET/HEAD, 206 slices
/// for Range requests, stable validators for resume checks.
pub struct RangeFile {
    data: Arc<Vec<u8>>,
    etag: String,
    last_modified: String,
    ranged_requests: Arc<AtomicUsize>,
}

impl RangeFile {
    pub fn new(data: Vec<u8>, etag: &str) -> Self {
        Self {
            data: Arc::new(data),
            etag: etag.to_string(),
            last_modified: "Wed, 21 Oct 2015 07:28:00 GMT".to_string(),
            ranged_requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of requests that carried a Range header.
    pub fn ranged_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.ranged_requests)
    }

    /// Mounts this file at `path` on the server, answering all methods.
    pub async fn mount(self, server: &MockServer, path: &str) {
        Mock::given(wiremock::matchers::path(path))
            .respond_with(self)
            .mount(server)
            .await;
    }

    fn base_headers(&self, template: ResponseTemplate) -> ResponseTemplate {
        template
            .insert_header("Accept-Ranges", "bytes")
            .insert_header("ETag", self.etag.as_str())
            .insert_header("Last-Modified", self.last_modified.as_str())
            .insert_header("Content-Type", "application/octet-stream")
    }
}

impl Respond for RangeFile {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("range")
            .and_then(|value| value.to_str().ok())
            .and_then(parse_range);

        match range {
            Some((start, end)) => {
                self.ranged_requests.fetch_add(1, Ordering::SeqCst);
                let end = end
                    .unwrap_or(self.data.len() as u64 - 1)
                    .min(self.data.len() as u64 - 1);
                if start > end {
                    return ResponseTemplate::new(416);
                }
                let slice = self.data[start as usize..=end as usize].to_vec();
                self.base_headers(ResponseTemplate::new(206))
                    .insert_header(
                        "Content-Range",
                        format!("bytes {start}-{end}/{}", self.data.len()).as_str(),
                    )
                    .set_body_bytes(slice)
            }
            None => self
                .base_headers(ResponseTemplate::new(200))
                .set_body_bytes(self.data.as_slice().to_vec()),
        }
    }
}

/// Parses `bytes=a-b` / `bytes=a-` into `(start, Option<end>)`.
fn parse_range(header: &str) -> Option<(u64, Option<u64>)> {
    let spec = header.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some((start, end))
}

/// Deterministic pseudo-random payload so corruption shows up as a
/// content mismatch, not just a length mismatch.
pub fn payload(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_4f6c_dd1du64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state & 0xff) as u8
        })
        .collect()
}

/// Engine configuration rooted in a temp directory.
pub fn test_config(root: &std::path::Path) -> EngineConfig {
    EngineConfig {
        data_dir: root.join("data"),
        default_save_dir: root.join("downloads"),
        ..EngineConfig::default()
    }
}
