//! On-disk text format for the download database.
//!
//! The snapshot is a line-oriented UTF-8 file:
//!
//! ```text
//! IDMCLONE_DB_V1
//! ENTRY_COUNT=N
//! ---
//! BEGIN_ENTRY
//! key=value
//! seg=start,end,downloaded,connectionId,complete
//! END_ENTRY
//! END_DB
//! ```
//!
//! Unknown keys are preserved verbatim across load/save so that newer
//! versions of the format can round-trip through older builds.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use tracing::warn;

use super::entry::{DownloadEntry, DownloadStatus, SegmentInfo};
use super::error::DbError;

/// Magic first line of every snapshot.
pub const HEADER: &str = "IDMCLONE_DB_V1";

/// Serializes the full catalog into snapshot text.
#[must_use]
pub fn serialize(entries: &BTreeMap<String, DownloadEntry>) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail; discard the fmt Results.
    let _ = writeln!(out, "{HEADER}");
    let _ = writeln!(out, "ENTRY_COUNT={}", entries.len());
    let _ = writeln!(out, "---");

    for entry in entries.values() {
        let _ = writeln!(out, "BEGIN_ENTRY");
        let _ = writeln!(out, "id={}", entry.id);
        let _ = writeln!(out, "url={}", entry.url);
        let _ = writeln!(out, "finalUrl={}", entry.final_url);
        let _ = writeln!(out, "fileName={}", entry.file_name);
        let _ = writeln!(out, "savePath={}", entry.save_path.display());
        let _ = writeln!(out, "fileSize={}", entry.file_size);
        let _ = writeln!(out, "downloadedBytes={}", entry.downloaded_bytes);
        let _ = writeln!(out, "status={}", entry.status.code());
        let _ = writeln!(out, "category={}", entry.category);
        let _ = writeln!(out, "description={}", entry.description);
        let _ = writeln!(out, "referrer={}", entry.referrer);
        let _ = writeln!(out, "userAgent={}", entry.user_agent);
        let _ = writeln!(out, "numConnections={}", entry.num_connections);
        let _ = writeln!(out, "resumeSupported={}", i32::from(entry.resume_supported));
        let _ = writeln!(out, "etag={}", entry.etag);
        let _ = writeln!(out, "lastModified={}", entry.last_modified);
        let _ = writeln!(out, "errorMessage={}", entry.error_message);
        let _ = writeln!(out, "retryCount={}", entry.retry_count);
        let _ = writeln!(out, "queueId={}", entry.queue_id);
        let _ = writeln!(out, "checksum={}", entry.checksum);
        let _ = writeln!(out, "checksumType={}", entry.checksum_type);

        for (key, value) in &entry.extra_fields {
            let _ = writeln!(out, "{key}={value}");
        }

        let _ = writeln!(out, "segmentCount={}", entry.segments.len());
        for seg in &entry.segments {
            let _ = writeln!(
                out,
                "seg={},{},{},{},{}",
                seg.start,
                seg.end,
                seg.downloaded,
                seg.connection_id,
                i32::from(seg.complete)
            );
        }

        let _ = writeln!(out, "END_ENTRY");
    }

    let _ = writeln!(out, "END_DB");
    out
}

/// Parses snapshot text back into the catalog.
///
/// Individually malformed lines are skipped with a warning rather than
/// failing the whole load; only a bad header is fatal.
///
/// # Errors
///
/// Returns [`DbError::InvalidFormat`] when the header line is wrong.
pub fn parse(text: &str, path: &Path) -> Result<BTreeMap<String, DownloadEntry>, DbError> {
    let mut lines = text.lines();

    match lines.next() {
        Some(HEADER) => {}
        other => {
            return Err(DbError::invalid_format(
                path,
                format!("expected `{HEADER}`, found {other:?}"),
            ));
        }
    }

    // Skip the remaining header lines up to the `---` delimiter.
    for line in lines.by_ref() {
        if line == "---" {
            break;
        }
    }

    let mut entries = BTreeMap::new();
    let mut current: Option<DownloadEntry> = None;

    for line in lines {
        match line {
            "END_DB" => break,
            "BEGIN_ENTRY" => {
                current = Some(DownloadEntry::default());
                continue;
            }
            "END_ENTRY" => {
                if let Some(entry) = current.take() {
                    if entry.id.is_empty() {
                        warn!(path = %path.display(), "dropping entry without id");
                    } else {
                        entries.insert(entry.id.clone(), entry);
                    }
                }
                continue;
            }
            _ => {}
        }

        let Some(entry) = current.as_mut() else {
            continue; // stray line outside an entry block
        };

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        apply_field(entry, key, value);
    }

    Ok(entries)
}

/// Applies one `key=value` line to an entry under construction.
fn apply_field(entry: &mut DownloadEntry, key: &str, value: &str) {
    match key {
        "id" => entry.id = value.to_string(),
        "url" => entry.url = value.to_string(),
        "finalUrl" => entry.final_url = value.to_string(),
        "fileName" => entry.file_name = value.to_string(),
        "savePath" => entry.save_path = value.into(),
        "fileSize" => entry.file_size = value.parse().unwrap_or(-1),
        "downloadedBytes" => entry.downloaded_bytes = value.parse().unwrap_or(0),
        "status" => {
            entry.status = value
                .parse()
                .ok()
                .and_then(DownloadStatus::from_code)
                .unwrap_or(DownloadStatus::Queued);
        }
        "category" => entry.category = value.to_string(),
        "description" => entry.description = value.to_string(),
        "referrer" => entry.referrer = value.to_string(),
        "userAgent" => entry.user_agent = value.to_string(),
        "numConnections" => {
            entry.num_connections = value.parse().unwrap_or(crate::config::DEFAULT_MAX_CONNECTIONS);
        }
        "resumeSupported" => entry.resume_supported = value == "1",
        "etag" => entry.etag = value.to_string(),
        "lastModified" => entry.last_modified = value.to_string(),
        "errorMessage" => entry.error_message = value.to_string(),
        "retryCount" => entry.retry_count = value.parse().unwrap_or(0),
        "queueId" => entry.queue_id = value.to_string(),
        "checksum" => entry.checksum = value.to_string(),
        "checksumType" => entry.checksum_type = value.to_string(),
        "segmentCount" => {} // derived from the seg lines that follow
        "seg" => {
            if let Some(seg) = parse_segment(value) {
                entry.segments.push(seg);
            } else {
                warn!(value, "skipping malformed segment line");
            }
        }
        _ => entry
            .extra_fields
            .push((key.to_string(), value.to_string())),
    }
}

/// Parses a `seg=` tuple: `start,end,downloaded,connectionId,complete`.
fn parse_segment(value: &str) -> Option<SegmentInfo> {
    let mut parts = value.split(',');
    let start = parts.next()?.parse().ok()?;
    let end = parts.next()?.parse().ok()?;
    let downloaded = parts.next()?.parse().ok()?;
    let connection_id = parts.next()?.parse().ok()?;
    // The complete flag was absent in very old snapshots; default to 0.
    let complete = parts.next().map_or(0, |v| v.parse().unwrap_or(0));
    Some(SegmentInfo {
        start,
        end,
        downloaded,
        connection_id,
        complete: complete != 0,
    })
}
