//! Crash-safe resume: segment snapshots and server revalidation.
//!
//! The segment map of an in-flight download is persisted every few
//! seconds to `<target>.segstate` so a crash or pause loses at most one
//! snapshot interval of bookkeeping (the bytes themselves are already in
//! the partial file). The snapshot is a small little-endian binary file:
//!
//! ```text
//! magic (u32, "SEGI") | version (u32, =1) | fileSize (i64) | count (u32)
//! repeat count times:  id (i32) | start (i64) | end (i64)
//!                    | cursor (i64) | status (u8)
//! ```
//!
//! The writer builds the whole snapshot in a temp file and renames it
//! into place, so a torn write can never corrupt a previously good
//! snapshot. On load, non-Complete statuses collapse to Pending.

use std::fs;
use std::io::Write as _;
use std::path::Path;

use tracing::{debug, info, instrument, warn};

use crate::db::DownloadEntry;

use super::client::ResponseInfo;
use super::error::DownloadError;
use super::segment::{SegmentRecord, SegmentStatus};

/// "SEGI" in little-endian byte order.
const SNAPSHOT_MAGIC: u32 = 0x5345_4749;

/// Current snapshot version.
const SNAPSHOT_VERSION: u32 = 1;

/// Fixed bytes per segment record: i32 + 3 x i64 + u8.
const RECORD_SIZE: usize = 4 + 8 + 8 + 8 + 1;

/// Fixed header size: magic + version + fileSize + count.
const HEADER_SIZE: usize = 4 + 4 + 8 + 4;

/// Checks whether a partial transfer can be resumed against the probed
/// server state.
///
/// Resumable iff the server advertises byte-range support, the ETag
/// matches when both sides have one, otherwise Last-Modified matches
/// when both sides have one, and the content length is unchanged when
/// both sides know it. On success the entry's cached validators are
/// refreshed from the response.
#[instrument(skip(entry, probe), fields(id = %entry.id))]
pub fn validate(entry: &mut DownloadEntry, probe: &ResponseInfo) -> bool {
    if !probe.accept_ranges {
        warn!("server does not support range requests");
        entry.resume_supported = false;
        return false;
    }

    if !entry.etag.is_empty() && !probe.etag.is_empty() && entry.etag != probe.etag {
        warn!(cached = %entry.etag, server = %probe.etag, "ETag mismatch");
        return false;
    }

    if !entry.last_modified.is_empty()
        && !probe.last_modified.is_empty()
        && entry.last_modified != probe.last_modified
    {
        warn!("Last-Modified mismatch");
        return false;
    }

    if entry.file_size > 0 && probe.content_length > 0 && entry.file_size != probe.content_length {
        warn!(
            cached = entry.file_size,
            server = probe.content_length,
            "file size changed"
        );
        return false;
    }

    if !probe.etag.is_empty() {
        entry.etag = probe.etag.clone();
    }
    if !probe.last_modified.is_empty() {
        entry.last_modified = probe.last_modified.clone();
    }
    if probe.content_length > 0 {
        entry.file_size = probe.content_length;
    }
    entry.resume_supported = true;

    info!("resume validated");
    true
}

/// Writes the segment snapshot for an entry atomically.
///
/// # Errors
///
/// Returns [`DownloadError::Io`] when the temp file cannot be written or
/// renamed into place.
pub fn save_state(entry: &DownloadEntry, records: &[SegmentRecord]) -> Result<(), DownloadError> {
    let path = entry.segment_path();
    save_snapshot(&path, entry.file_size, records)
}

/// Writes a snapshot file atomically (temp file + rename).
///
/// # Errors
///
/// Returns [`DownloadError::Io`] on any write failure.
pub fn save_snapshot(
    path: &Path,
    file_size: i64,
    records: &[SegmentRecord],
) -> Result<(), DownloadError> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + records.len() * RECORD_SIZE);
    buf.extend_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
    buf.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    buf.extend_from_slice(&file_size.to_le_bytes());
    #[allow(clippy::cast_possible_truncation)]
    buf.extend_from_slice(&(records.len() as u32).to_le_bytes());

    for rec in records {
        buf.extend_from_slice(&rec.id.to_le_bytes());
        buf.extend_from_slice(&rec.start.to_le_bytes());
        buf.extend_from_slice(&rec.end.to_le_bytes());
        buf.extend_from_slice(&rec.cursor.to_le_bytes());
        buf.push(rec.status as u8);
    }

    let tmp_path = path.with_extension("segstate.tmp");
    {
        let mut file = fs::File::create(&tmp_path).map_err(|e| DownloadError::io(&tmp_path, e))?;
        file.write_all(&buf).map_err(|e| DownloadError::io(&tmp_path, e))?;
        file.flush().map_err(|e| DownloadError::io(&tmp_path, e))?;
    }
    fs::rename(&tmp_path, path).map_err(|e| DownloadError::io(path, e))?;

    debug!(path = %path.display(), segments = records.len(), "segment snapshot saved");
    Ok(())
}

/// Loads the segment snapshot for an entry, if one exists and parses.
///
/// Returns `(file_size, records)`; non-Complete statuses come back as
/// Pending. A missing, truncated, or mismatched file yields `None` -
/// resume falls back to a fresh start rather than failing.
#[must_use]
pub fn load_state(entry: &DownloadEntry) -> Option<(i64, Vec<SegmentRecord>)> {
    load_snapshot(&entry.segment_path())
}

/// Loads and decodes a snapshot file.
#[must_use]
pub fn load_snapshot(path: &Path) -> Option<(i64, Vec<SegmentRecord>)> {
    let data = fs::read(path).ok()?;
    if data.len() < HEADER_SIZE {
        warn!(path = %path.display(), "snapshot truncated");
        return None;
    }

    let magic = u32::from_le_bytes(data[0..4].try_into().ok()?);
    let version = u32::from_le_bytes(data[4..8].try_into().ok()?);
    if magic != SNAPSHOT_MAGIC || version != SNAPSHOT_VERSION {
        warn!(path = %path.display(), magic, version, "snapshot header mismatch");
        return None;
    }

    let file_size = i64::from_le_bytes(data[8..16].try_into().ok()?);
    let count = u32::from_le_bytes(data[16..20].try_into().ok()?) as usize;

    if data.len() < HEADER_SIZE + count * RECORD_SIZE {
        warn!(path = %path.display(), count, "snapshot shorter than record count");
        return None;
    }

    let mut records = Vec::with_capacity(count);
    let mut pos = HEADER_SIZE;
    for _ in 0..count {
        let id = i32::from_le_bytes(data[pos..pos + 4].try_into().ok()?);
        let start = i64::from_le_bytes(data[pos + 4..pos + 12].try_into().ok()?);
        let end = i64::from_le_bytes(data[pos + 12..pos + 20].try_into().ok()?);
        let cursor = i64::from_le_bytes(data[pos + 20..pos + 28].try_into().ok()?);
        let status = SegmentStatus::from_code(data[pos + 28])?;
        pos += RECORD_SIZE;

        let status = if status == SegmentStatus::Complete {
            SegmentStatus::Complete
        } else {
            SegmentStatus::Pending
        };

        records.push(SegmentRecord {
            id,
            start,
            end,
            cursor,
            status,
        });
    }

    info!(path = %path.display(), segments = records.len(), "segment snapshot loaded");
    Some((file_size, records))
}

/// Removes the partial file and segment snapshot of an entry. Best
/// effort: missing files are fine.
pub fn cleanup(entry: &DownloadEntry) {
    let _ = fs::remove_file(entry.partial_path());
    let _ = fs::remove_file(entry.segment_path());
    debug!(id = %entry.id, "partial artifacts removed");
}

/// True when the entry has any on-disk partial artifacts.
#[must_use]
pub fn has_partial(entry: &DownloadEntry) -> bool {
    entry.partial_path().exists() || entry.segment_path().exists()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn records() -> Vec<SegmentRecord> {
        vec![
            SegmentRecord {
                id: 0,
                start: 0,
                end: 499,
                cursor: 500,
                status: SegmentStatus::Complete,
            },
            SegmentRecord {
                id: 1,
                start: 500,
                end: 999,
                cursor: 700,
                status: SegmentStatus::Active,
            },
            SegmentRecord {
                id: 2,
                start: 1000,
                end: 1499,
                cursor: 1000,
                status: SegmentStatus::Error,
            },
        ]
    }

    fn probe(etag: &str, last_modified: &str, length: i64, ranges: bool) -> ResponseInfo {
        ResponseInfo {
            status: 200,
            content_length: length,
            content_type: String::new(),
            disposition_filename: None,
            accept_ranges: ranges,
            etag: etag.to_string(),
            last_modified: last_modified.to_string(),
            final_url: "https://example.com/f".to_string(),
        }
    }

    fn entry_with(etag: &str, last_modified: &str, size: i64) -> DownloadEntry {
        DownloadEntry {
            etag: etag.to_string(),
            last_modified: last_modified.to_string(),
            file_size: size,
            ..DownloadEntry::new("https://example.com/f")
        }
    }

    // ==================== Snapshot Tests ====================

    #[test]
    fn test_snapshot_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.segstate");

        save_snapshot(&path, 1500, &records()).unwrap();
        let (size, loaded) = load_snapshot(&path).unwrap();

        assert_eq!(size, 1500);
        assert_eq!(loaded.len(), 3);
        // Ranges and cursors survive exactly.
        assert_eq!(loaded[1].start, 500);
        assert_eq!(loaded[1].cursor, 700);
        // Complete survives; Active and Error collapse to Pending.
        assert_eq!(loaded[0].status, SegmentStatus::Complete);
        assert_eq!(loaded[1].status, SegmentStatus::Pending);
        assert_eq!(loaded[2].status, SegmentStatus::Pending);
    }

    #[test]
    fn test_snapshot_magic_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.segstate");
        save_snapshot(&path, 100, &[]).unwrap();

        let data = fs::read(&path).unwrap();
        assert_eq!(&data[0..4], &[0x49, 0x47, 0x45, 0x53]); // "IGES" LE = "SEGI"
        assert_eq!(u32::from_le_bytes(data[4..8].try_into().unwrap()), 1);
    }

    #[test]
    fn test_snapshot_overwrites_previous() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.segstate");

        save_snapshot(&path, 1500, &records()).unwrap();
        save_snapshot(&path, 1500, &records()[..1]).unwrap();

        let (_, loaded) = load_snapshot(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        // No temp file left behind.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_truncated_snapshot_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.segstate");
        save_snapshot(&path, 1500, &records()).unwrap();

        let mut data = fs::read(&path).unwrap();
        data.truncate(data.len() - 5);
        fs::write(&path, data).unwrap();

        assert!(load_snapshot(&path).is_none());
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.segstate");
        fs::write(&path, vec![0u8; 64]).unwrap();
        assert!(load_snapshot(&path).is_none());
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        assert!(load_snapshot(Path::new("/nonexistent/f.segstate")).is_none());
    }

    // ==================== Validation Tests ====================

    #[test]
    fn test_validate_matching_etag() {
        let mut entry = entry_with("\"v1\"", "", 1000);
        assert!(validate(&mut entry, &probe("\"v1\"", "", 1000, true)));
        assert!(entry.resume_supported);
    }

    #[test]
    fn test_validate_etag_mismatch() {
        let mut entry = entry_with("\"v1\"", "", 1000);
        assert!(!validate(&mut entry, &probe("\"v2\"", "", 1000, true)));
    }

    #[test]
    fn test_validate_last_modified_when_no_etag() {
        let date = "Wed, 21 Oct 2015 07:28:00 GMT";
        let mut entry = entry_with("", date, 1000);
        assert!(validate(&mut entry, &probe("", date, 1000, true)));

        let mut entry = entry_with("", date, 1000);
        assert!(!validate(
            &mut entry,
            &probe("", "Thu, 22 Oct 2015 07:28:00 GMT", 1000, true)
        ));
    }

    #[test]
    fn test_validate_size_change_rejected() {
        let mut entry = entry_with("\"v1\"", "", 1000);
        assert!(!validate(&mut entry, &probe("\"v1\"", "", 2000, true)));
    }

    #[test]
    fn test_validate_no_range_support_clears_flag() {
        let mut entry = entry_with("\"v1\"", "", 1000);
        entry.resume_supported = true;
        assert!(!validate(&mut entry, &probe("\"v1\"", "", 1000, false)));
        assert!(!entry.resume_supported);
    }

    #[test]
    fn test_validate_missing_validators_on_either_side_pass() {
        // No cached validators at all: range support alone decides.
        let mut entry = entry_with("", "", -1);
        assert!(validate(&mut entry, &probe("\"v1\"", "", 1000, true)));
        // Validators were adopted for next time.
        assert_eq!(entry.etag, "\"v1\"");
        assert_eq!(entry.file_size, 1000);
    }

    // ==================== Cleanup Tests ====================

    #[test]
    fn test_cleanup_removes_artifacts() {
        let dir = TempDir::new().unwrap();
        let entry = DownloadEntry {
            file_name: "f.bin".to_string(),
            save_path: PathBuf::from(dir.path()),
            ..DownloadEntry::new("https://example.com/f.bin")
        };

        fs::write(entry.partial_path(), b"x").unwrap();
        fs::write(entry.segment_path(), b"y").unwrap();
        assert!(has_partial(&entry));

        cleanup(&entry);
        assert!(!has_partial(&entry));

        // Idempotent.
        cleanup(&entry);
    }
}
