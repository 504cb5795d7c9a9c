//! Compatibility tests for the on-disk database format.
//!
//! The snapshot grammar and journal line format are external interfaces:
//! other tooling reads and writes them. These tests pin the exact shapes
//! by parsing handwritten files and inspecting emitted ones.

use std::fs;

use tempfile::TempDir;

use accel::{Database, DownloadEntry, DownloadStatus};

/// A snapshot file as another tool (or an older build) would write it.
const HANDWRITTEN_SNAPSHOT: &str = "\
IDMCLONE_DB_V1
ENTRY_COUNT=2
---
BEGIN_ENTRY
id=11111111-2222-3333-4444-555555555555
url=https://mirror.example.org/dists/base.iso
finalUrl=https://cdn.example.org/base.iso
fileName=base.iso
savePath=/srv/downloads
fileSize=734003200
downloadedBytes=367001600
status=3
category=Programs
description=nightly image
referrer=https://mirror.example.org/
userAgent=
numConnections=8
resumeSupported=1
etag=\"a1b2c3\"
lastModified=Tue, 15 Jul 2025 09:30:00 GMT
errorMessage=
retryCount=0
queueId=
checksum=0123456789abcdef0123456789abcdef
checksumType=md5
futureKnob=enabled
segmentCount=2
seg=0,367001599,367001600,-1,1
seg=367001600,734003199,0,-1,0
END_ENTRY
BEGIN_ENTRY
id=aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee
url=ftp://files.example.net/pub/tool.tar.gz
fileName=tool.tar.gz
savePath=/srv/downloads
fileSize=1048576
downloadedBytes=1048576
status=4
category=Compressed
segmentCount=0
END_ENTRY
END_DB
";

#[test]
fn test_parses_handwritten_snapshot() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("downloads.db");
    fs::write(&path, HANDWRITTEN_SNAPSHOT).unwrap();

    let db = Database::open(&path).unwrap();
    assert_eq!(db.len(), 2);

    let paused = db.get("11111111-2222-3333-4444-555555555555").unwrap();
    assert_eq!(paused.status, DownloadStatus::Paused);
    assert_eq!(paused.file_size, 734_003_200);
    assert_eq!(paused.downloaded_bytes, 367_001_600);
    assert_eq!(paused.num_connections, 8);
    assert!(paused.resume_supported);
    assert_eq!(paused.etag, "\"a1b2c3\"");
    assert_eq!(paused.checksum_type, "md5");
    assert_eq!(paused.segments.len(), 2);
    assert!(paused.segments[0].complete);
    assert_eq!(paused.segments[1].start, 367_001_600);
    assert_eq!(paused.segments[1].remaining(), 367_001_600);

    let complete = db.get("aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee").unwrap();
    assert_eq!(complete.status, DownloadStatus::Complete);
    assert!(complete.segments.is_empty());
}

#[test]
fn test_round_trip_preserves_unknown_keys_and_shape() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("downloads.db");
    fs::write(&path, HANDWRITTEN_SNAPSHOT).unwrap();

    // Load, mutate nothing structural, flush.
    let db = Database::open(&path).unwrap();
    let entry = db.get("11111111-2222-3333-4444-555555555555").unwrap();
    db.update(&entry).unwrap();
    db.flush().unwrap();

    let written = fs::read_to_string(&path).unwrap();
    // Header and trailer survive.
    assert!(written.starts_with("IDMCLONE_DB_V1\n"));
    assert!(written.contains("ENTRY_COUNT=2"));
    assert!(written.trim_end().ends_with("END_DB"));
    // The key unknown to this build is preserved verbatim.
    assert!(written.contains("futureKnob=enabled"));
    // Segment tuples keep the start,end,downloaded,connection,complete
    // shape.
    assert!(written.contains("seg=0,367001599,367001600,-1,1"));
    assert!(written.contains("seg=367001600,734003199,0,-1,0"));

    // And the rewritten file still loads to the same state.
    let reloaded = Database::open(&path).unwrap();
    assert_eq!(reloaded.len(), 2);
    let entry = reloaded.get("11111111-2222-3333-4444-555555555555").unwrap();
    assert_eq!(
        entry.extra_fields,
        vec![("futureKnob".to_string(), "enabled".to_string())]
    );
}

#[test]
fn test_journal_lines_have_op_id_name_shape() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("downloads.db");
    let db = Database::open(&path).unwrap();

    let mut entry = DownloadEntry::new("https://example.com/a.zip");
    entry.file_name = "a.zip".to_string();
    let id = db.add(&mut entry).unwrap();

    entry.downloaded_bytes = 10;
    db.update(&entry).unwrap();
    db.remove(&id, false).unwrap();

    let journal = fs::read_to_string(dir.path().join("downloads.db.journal")).unwrap();
    let lines: Vec<&str> = journal.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], format!("ADD|{id}|a.zip"));
    assert_eq!(lines[1], format!("UPDATE|{id}|a.zip"));
    assert_eq!(lines[2], format!("REMOVE|{id}|a.zip"));

    // Flush commits the state and retires the journal.
    db.flush().unwrap();
    assert!(!dir.path().join("downloads.db.journal").exists());
}

#[test]
fn test_mutation_visible_or_absent_after_simulated_crash() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("downloads.db");

    let id = {
        let db = Database::open(&path).unwrap();
        let mut entry = DownloadEntry::new("https://example.com/a.zip");
        entry.file_name = "a.zip".to_string();
        entry.file_size = 4096;
        let id = db.add(&mut entry).unwrap();
        db.flush().unwrap();

        // A second mutation is journalled but the process "dies" before
        // flush: drop the handle with the journal still on disk.
        entry.downloaded_bytes = 2048;
        db.update(&entry).unwrap();
        id
    };

    assert!(dir.path().join("downloads.db.journal").exists());

    // Recovery: the entry is present in its last committed shape; the
    // in-progress update is lost whole, never half-applied.
    let db = Database::open(&path).unwrap();
    let entry = db.get(&id).unwrap();
    assert_eq!(entry.file_size, 4096);
    assert_eq!(entry.downloaded_bytes, 0);

    // The leftover journal forces a rewrite on the next flush.
    db.flush().unwrap();
    assert!(!dir.path().join("downloads.db.journal").exists());
}
