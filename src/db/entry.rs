//! Download entry model: the durable record of a single transfer.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::SystemTime;

use uuid::Uuid;

use crate::config;

/// Number of speed samples kept for the rolling average (one per second).
const SPEED_HISTORY_LEN: usize = 60;

/// Lifecycle status of a download entry.
///
/// The integer values are the on-disk encoding and must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DownloadStatus {
    /// Added but not yet started.
    Queued = 0,
    /// Probe request in flight.
    Connecting = 1,
    /// Workers are transferring data.
    Downloading = 2,
    /// Stopped by the user; resumable.
    Paused = 3,
    /// Finalized successfully.
    Complete = 4,
    /// Failed; requires an explicit restart.
    Error = 5,
    /// Waiting for a retry window.
    Waiting = 6,
    /// All segments done, finalize in progress.
    Merging = 7,
}

impl DownloadStatus {
    /// Decodes the on-disk integer representation.
    #[must_use]
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Queued),
            1 => Some(Self::Connecting),
            2 => Some(Self::Downloading),
            3 => Some(Self::Paused),
            4 => Some(Self::Complete),
            5 => Some(Self::Error),
            6 => Some(Self::Waiting),
            7 => Some(Self::Merging),
            _ => None,
        }
    }

    /// The on-disk integer representation.
    #[must_use]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Human-readable status label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Connecting => "Connecting",
            Self::Downloading => "Downloading",
            Self::Paused => "Paused",
            Self::Complete => "Complete",
            Self::Error => "Error",
            Self::Waiting => "Waiting",
            Self::Merging => "Assembling",
        }
    }
}

/// Persisted view of one segment, as stored in the database snapshot.
///
/// This is the `seg=` tuple of the database format; the live segment map
/// with cursors and ownership lives in the segment manager while a
/// download is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Start position in the file.
    pub start: i64,
    /// End position, inclusive.
    pub end: i64,
    /// Bytes downloaded within this segment.
    pub downloaded: i64,
    /// Owning connection at snapshot time (-1 = unassigned).
    pub connection_id: i32,
    /// Segment fully downloaded.
    pub complete: bool,
}

impl SegmentInfo {
    /// Bytes still missing from this segment.
    #[must_use]
    pub fn remaining(&self) -> i64 {
        (self.end - self.start + 1) - self.downloaded
    }
}

/// The durable record of a transfer.
///
/// Credentials, cookies, and POST bodies are request decoration consumed
/// at runtime and are never written to disk.
#[derive(Debug, Clone)]
pub struct DownloadEntry {
    /// Opaque unique ID, textually encoded.
    pub id: String,
    /// Original URL as added.
    pub url: String,
    /// URL after redirects, recorded by the probe.
    pub final_url: String,
    /// Target file name.
    pub file_name: String,
    /// Target directory.
    pub save_path: PathBuf,
    /// Total size in bytes; -1 = unknown.
    pub file_size: i64,
    /// Bytes downloaded so far.
    pub downloaded_bytes: i64,
    /// Lifecycle status.
    pub status: DownloadStatus,
    /// Category derived from the file extension.
    pub category: String,
    /// Free-form user description.
    pub description: String,
    /// Referrer header for requests.
    pub referrer: String,
    /// Cookie header for requests (runtime only, not persisted).
    pub cookies: String,
    /// User-agent override; empty = engine default.
    pub user_agent: String,
    /// Basic-auth username (runtime only).
    pub username: String,
    /// Basic-auth password (runtime only).
    pub password: String,
    /// POST body for the opening request (runtime only).
    pub post_data: String,
    /// Requested connection count (1..=32).
    pub num_connections: u32,
    /// Server advertises byte-range support.
    pub resume_supported: bool,
    /// Server ETag validator.
    pub etag: String,
    /// Server Last-Modified validator.
    pub last_modified: String,
    /// Response content type.
    pub content_type: String,
    /// Last observed error cause.
    pub error_message: String,
    /// Retries consumed so far.
    pub retry_count: u32,
    /// Retry ceiling per worker assignment.
    pub max_retries: u32,
    /// Owning queue, if any.
    pub queue_id: String,
    /// Expected hash in hex, if known.
    pub checksum: String,
    /// Hash algorithm tag: md5, sha1, or sha256.
    pub checksum_type: String,
    /// When the entry was added.
    pub date_added: SystemTime,
    /// When the transfer completed, if it has.
    pub date_completed: Option<SystemTime>,
    /// Current transfer rate in bytes/sec.
    pub current_speed: f64,
    /// Rolling average over the last minute.
    pub average_speed: f64,
    /// Last known segment map.
    pub segments: Vec<SegmentInfo>,
    /// Unrecognized `key=value` lines, preserved verbatim across
    /// load/save for forward compatibility.
    pub extra_fields: Vec<(String, String)>,

    pub(crate) speed_history: VecDeque<f64>,
}

impl Default for DownloadEntry {
    fn default() -> Self {
        Self {
            id: String::new(),
            url: String::new(),
            final_url: String::new(),
            file_name: String::new(),
            save_path: PathBuf::new(),
            file_size: -1,
            downloaded_bytes: 0,
            status: DownloadStatus::Queued,
            category: String::new(),
            description: String::new(),
            referrer: String::new(),
            cookies: String::new(),
            user_agent: String::new(),
            username: String::new(),
            password: String::new(),
            post_data: String::new(),
            num_connections: config::DEFAULT_MAX_CONNECTIONS,
            resume_supported: false,
            etag: String::new(),
            last_modified: String::new(),
            content_type: String::new(),
            error_message: String::new(),
            retry_count: 0,
            max_retries: config::DEFAULT_RETRY_COUNT,
            queue_id: String::new(),
            checksum: String::new(),
            checksum_type: String::new(),
            date_added: SystemTime::now(),
            date_completed: None,
            current_speed: 0.0,
            average_speed: 0.0,
            segments: Vec::new(),
            extra_fields: Vec::new(),
            speed_history: VecDeque::new(),
        }
    }
}

impl DownloadEntry {
    /// Creates a new entry for a URL with defaults and a fresh ID.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: Self::generate_id(),
            url: url.into(),
            ..Self::default()
        }
    }

    /// Generates a new opaque entry ID.
    #[must_use]
    pub fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Full path of the finished target file.
    #[must_use]
    pub fn full_path(&self) -> PathBuf {
        self.save_path.join(&self.file_name)
    }

    /// Path of the in-progress partial file (`<target>.partial`).
    #[must_use]
    pub fn partial_path(&self) -> PathBuf {
        let mut path = self.full_path().into_os_string();
        path.push(".partial");
        PathBuf::from(path)
    }

    /// Path of the segment snapshot file (`<target>.segstate`).
    #[must_use]
    pub fn segment_path(&self) -> PathBuf {
        let mut path = self.full_path().into_os_string();
        path.push(".segstate");
        PathBuf::from(path)
    }

    /// Overall progress in percent; 0 when the size is unknown.
    #[must_use]
    pub fn progress_percent(&self) -> f64 {
        if self.file_size <= 0 {
            return 0.0;
        }
        self.downloaded_bytes as f64 / self.file_size as f64 * 100.0
    }

    /// Records a speed sample and refreshes the rolling average.
    pub fn record_speed(&mut self, speed: f64) {
        self.current_speed = speed;
        self.speed_history.push_back(speed);
        if self.speed_history.len() > SPEED_HISTORY_LEN {
            self.speed_history.pop_front();
        }
        let sum: f64 = self.speed_history.iter().sum();
        self.average_speed = sum / self.speed_history.len() as f64;
    }
}
