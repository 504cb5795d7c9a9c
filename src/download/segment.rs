//! Dynamic file segmentation.
//!
//! This is the distinguishing algorithm of the engine. Rather than
//! pre-splitting the file into N equal parts (which strands connections
//! when some parts finish early), segments are split dynamically as
//! connection slots free up: a worker asking for work either takes the
//! first unstarted segment or steals the far half of whichever active
//! segment has the most bytes left. Every connection is always
//! downloading useful data, and slow connections progressively lose
//! territory to fast ones.
//!
//! The segment list is an ordered partition of `[0, file_size)` with no
//! gaps and no overlap; all public methods uphold that invariant. The
//! map-wide mutex is only held for short, allocation-light critical
//! sections and never across I/O.

use std::sync::Mutex;
use std::time::Instant;

use tracing::{debug, info, instrument, warn};

use crate::db::SegmentInfo;

/// End marker for the single segment of an unknown-length download.
pub const UNKNOWN_END: i64 = i64::MAX;

/// Lifecycle status of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentStatus {
    /// Not yet started (or released for reassignment).
    Pending = 0,
    /// Currently owned by a worker.
    Active = 1,
    /// Fully downloaded.
    Complete = 2,
    /// Failed; eligible for reassignment after the owner's backoff.
    Error = 3,
}

impl SegmentStatus {
    /// Decodes the snapshot byte encoding.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Pending),
            1 => Some(Self::Active),
            2 => Some(Self::Complete),
            3 => Some(Self::Error),
            _ => None,
        }
    }
}

/// One contiguous byte range `[start, end]` (end inclusive) of the file.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Per-download segment ID.
    pub id: i32,
    /// Start position in the file.
    pub start: i64,
    /// End position, inclusive.
    pub end: i64,
    /// Write cursor: `start <= cursor <= end + 1`.
    pub cursor: i64,
    /// Owning worker slot (None = unassigned).
    pub owner: Option<usize>,
    /// Lifecycle status.
    pub status: SegmentStatus,
    /// Last progress timestamp, for stall detection.
    pub last_activity: Instant,
    /// Current transfer rate of the owning connection, bytes/sec.
    pub speed: f64,
}

impl Segment {
    /// Total bytes covered by this segment.
    #[must_use]
    pub fn total_bytes(&self) -> i64 {
        self.end - self.start + 1
    }

    /// Bytes already written.
    #[must_use]
    pub fn downloaded_bytes(&self) -> i64 {
        self.cursor - self.start
    }

    /// Bytes still missing.
    #[must_use]
    pub fn remaining_bytes(&self) -> i64 {
        self.end - self.cursor + 1
    }
}

/// Work assignment handed to a worker.
///
/// The worker owns this value for the duration of the fetch and tracks
/// its own write cursor; it never has to search the segment list while
/// streaming.
#[derive(Debug, Clone, Copy)]
pub struct Assignment {
    /// ID of the assigned segment.
    pub segment_id: i32,
    /// First byte to fetch (the segment's cursor at grant time).
    pub start: i64,
    /// Last byte, inclusive; [`UNKNOWN_END`] when the size is unknown.
    pub end: i64,
}

/// Result of a progress update, reflecting any concurrent split.
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    /// The segment's current end; shrinks when the tail was split away.
    pub end: i64,
    /// The segment is complete; the worker should stop streaming.
    pub complete: bool,
}

/// Record used by the binary snapshot (see the resume module).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRecord {
    /// Segment ID.
    pub id: i32,
    /// Start position.
    pub start: i64,
    /// End position, inclusive.
    pub end: i64,
    /// Write cursor.
    pub cursor: i64,
    /// Status at save time.
    pub status: SegmentStatus,
}

/// Per-download map of byte ranges with the dynamic split policy.
///
/// Shared behind an `Arc` between the orchestrator and its workers.
#[derive(Debug)]
pub struct SegmentManager {
    inner: Mutex<MapState>,
}

#[derive(Debug)]
struct MapState {
    segments: Vec<Segment>,
    file_size: i64,
    max_connections: usize,
    min_segment_size: i64,
    next_id: i32,
}

impl SegmentManager {
    /// Initializes a fresh map: one pending segment covering the whole
    /// file, or `[0, UNKNOWN_END]` when the size is unknown (<= 0).
    ///
    /// Splitting requires `min_segment_size` to be at least the chunk
    /// buffer size; the config validates that relationship.
    #[must_use]
    #[instrument]
    pub fn new(file_size: i64, max_connections: usize, min_segment_size: i64) -> Self {
        let end = if file_size > 0 {
            file_size - 1
        } else {
            UNKNOWN_END
        };

        let seed = Segment {
            id: 0,
            start: 0,
            end,
            cursor: 0,
            owner: None,
            status: SegmentStatus::Pending,
            last_activity: Instant::now(),
            speed: 0.0,
        };

        info!(file_size, max_connections, "segment map initialized");

        Self {
            inner: Mutex::new(MapState {
                segments: vec![seed],
                file_size,
                max_connections,
                min_segment_size,
                next_id: 1,
            }),
        }
    }

    /// Rebuilds the map from snapshot records (resume). Non-complete
    /// statuses collapse to Pending; ownership does not survive a
    /// session.
    #[must_use]
    pub fn restore(
        records: &[SegmentRecord],
        file_size: i64,
        max_connections: usize,
        min_segment_size: i64,
    ) -> Self {
        let mut next_id = 0;
        let segments = records
            .iter()
            .map(|rec| {
                next_id = next_id.max(rec.id + 1);
                let status = if rec.status == SegmentStatus::Complete {
                    SegmentStatus::Complete
                } else {
                    SegmentStatus::Pending
                };
                Segment {
                    id: rec.id,
                    start: rec.start,
                    end: rec.end,
                    cursor: rec.cursor.clamp(rec.start, rec.end.saturating_add(1)),
                    owner: None,
                    status,
                    last_activity: Instant::now(),
                    speed: 0.0,
                }
            })
            .collect::<Vec<_>>();

        info!(count = segments.len(), "segment map restored from snapshot");

        Self {
            inner: Mutex::new(MapState {
                segments,
                file_size,
                max_connections,
                min_segment_size,
                next_id,
            }),
        }
    }

    /// Assigns work to a connection slot.
    ///
    /// 1. At the connection cap -> `None`.
    /// 2. First Pending or Error segment -> assign it (preserves
    ///    in-order I/O).
    /// 3. Otherwise split the active segment with the most remaining
    ///    bytes, provided both halves stay at or above the floor.
    /// 4. No feasible split -> `None`.
    pub fn request_segment(&self, worker_id: usize) -> Option<Assignment> {
        let mut state = self.lock();

        let active = state
            .segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Active)
            .count();
        if active >= state.max_connections {
            debug!(worker_id, active, "connection cap reached");
            return None;
        }

        // Strategy 1: first unstarted or errored segment.
        if let Some(idx) = state
            .segments
            .iter()
            .position(|s| matches!(s.status, SegmentStatus::Pending | SegmentStatus::Error))
        {
            let seg = &mut state.segments[idx];
            seg.status = SegmentStatus::Active;
            seg.owner = Some(worker_id);
            seg.last_activity = Instant::now();
            let assignment = Assignment {
                segment_id: seg.id,
                start: seg.cursor,
                end: seg.end,
            };
            debug!(
                worker_id,
                segment = seg.id,
                start = assignment.start,
                end = assignment.end,
                "assigned pending segment"
            );
            return Some(assignment);
        }

        // Strategy 2: steal the far half of the largest active segment.
        let split = state.split_largest_active()?;
        let seg = state
            .segments
            .iter_mut()
            .find(|s| s.id == split)?;
        seg.status = SegmentStatus::Active;
        seg.owner = Some(worker_id);
        seg.last_activity = Instant::now();
        let assignment = Assignment {
            segment_id: seg.id,
            start: seg.start,
            end: seg.end,
        };
        info!(
            worker_id,
            segment = seg.id,
            start = assignment.start,
            end = assignment.end,
            "assigned split segment"
        );
        Some(assignment)
    }

    /// Advances a segment's cursor by `bytes_written` and refreshes its
    /// speed sample.
    ///
    /// Returns the segment's current end (which shrinks when its tail
    /// has been split away) and whether it is now complete, so the
    /// owning worker can stop without consulting the list again. If the
    /// cursor runs past the end (a server that ignored the upper bound),
    /// it is clamped to `end + 1` and the segment completes.
    pub fn update_progress(
        &self,
        segment_id: i32,
        bytes_written: i64,
        speed: f64,
    ) -> Option<ProgressUpdate> {
        let mut state = self.lock();
        let seg = state.segments.iter_mut().find(|s| s.id == segment_id)?;

        seg.cursor += bytes_written;
        if speed > 0.0 {
            seg.speed = speed;
        }
        seg.last_activity = Instant::now();

        if seg.cursor > seg.end {
            seg.cursor = seg.end + 1;
            seg.status = SegmentStatus::Complete;
            seg.owner = None;
            seg.speed = 0.0;
            debug!(segment = segment_id, "segment completed via progress update");
            return Some(ProgressUpdate {
                end: seg.end,
                complete: true,
            });
        }

        Some(ProgressUpdate {
            end: seg.end,
            complete: false,
        })
    }

    /// Marks a segment complete and releases its owner.
    pub fn mark_complete(&self, segment_id: i32) {
        let mut state = self.lock();
        if let Some(seg) = state.segments.iter_mut().find(|s| s.id == segment_id) {
            seg.status = SegmentStatus::Complete;
            seg.cursor = seg.end.saturating_add(1);
            seg.owner = None;
            seg.speed = 0.0;
            debug!(segment = segment_id, start = seg.start, end = seg.end, "segment complete");
        }
    }

    /// Shrinks an unknown-length segment to its cursor and completes it.
    ///
    /// Used when the body of a size-less download reaches EOF: the
    /// received byte count becomes the authoritative file size. Returns
    /// the resulting size.
    pub fn truncate_to_cursor(&self, segment_id: i32) -> i64 {
        let mut state = self.lock();
        if let Some(seg) = state.segments.iter_mut().find(|s| s.id == segment_id) {
            seg.end = seg.cursor - 1;
            seg.status = SegmentStatus::Complete;
            seg.owner = None;
            seg.speed = 0.0;
            info!(segment = segment_id, size = seg.cursor, "segment truncated at EOF");
        }
        let size = state
            .segments
            .iter()
            .map(|s| s.end.saturating_add(1))
            .max()
            .unwrap_or(0);
        state.file_size = size;
        size
    }

    /// Marks a segment errored; it becomes eligible for reassignment.
    pub fn mark_error(&self, segment_id: i32) {
        let mut state = self.lock();
        if let Some(seg) = state.segments.iter_mut().find(|s| s.id == segment_id) {
            seg.status = SegmentStatus::Error;
            seg.owner = None;
            seg.speed = 0.0;
            warn!(segment = segment_id, cursor = seg.cursor, "segment errored");
        }
    }

    /// Returns a non-complete segment to Pending (owner dropped without
    /// a verdict, e.g. on cancellation).
    pub fn release(&self, segment_id: i32) {
        let mut state = self.lock();
        if let Some(seg) = state.segments.iter_mut().find(|s| s.id == segment_id) {
            if seg.status != SegmentStatus::Complete {
                seg.status = SegmentStatus::Pending;
            }
            seg.owner = None;
            seg.speed = 0.0;
        }
    }

    /// True when every segment is complete and the list is non-empty.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        let state = self.lock();
        !state.segments.is_empty()
            && state
                .segments
                .iter()
                .all(|s| s.status == SegmentStatus::Complete)
    }

    /// Sum of downloaded bytes across all segments.
    #[must_use]
    pub fn total_downloaded(&self) -> i64 {
        self.lock().segments.iter().map(Segment::downloaded_bytes).sum()
    }

    /// Sum of active-segment speeds, bytes/sec.
    #[must_use]
    pub fn total_speed(&self) -> f64 {
        self.lock()
            .segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Active)
            .map(|s| s.speed)
            .sum()
    }

    /// Number of segments currently owned by workers.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.lock()
            .segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Active)
            .count()
    }

    /// Number of segments in the map.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.lock().segments.len()
    }

    /// The file size this map partitions (-1 or 0 = unknown).
    #[must_use]
    pub fn file_size(&self) -> i64 {
        self.lock().file_size
    }

    /// Clones the current segment list (UI display, event payloads).
    #[must_use]
    pub fn segments(&self) -> Vec<Segment> {
        self.lock().segments.clone()
    }

    /// Converts to persisted [`SegmentInfo`] tuples for the database.
    #[must_use]
    pub fn to_segment_infos(&self) -> Vec<SegmentInfo> {
        self.lock()
            .segments
            .iter()
            .map(|s| SegmentInfo {
                start: s.start,
                end: s.end,
                downloaded: s.downloaded_bytes(),
                connection_id: s.owner.map_or(-1, |w| w as i32),
                complete: s.status == SegmentStatus::Complete,
            })
            .collect()
    }

    /// Converts to snapshot records for the resume engine.
    #[must_use]
    pub fn to_records(&self) -> Vec<SegmentRecord> {
        self.lock()
            .segments
            .iter()
            .map(|s| SegmentRecord {
                id: s.id,
                start: s.start,
                end: s.end,
                cursor: s.cursor,
                status: s.status,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MapState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl MapState {
    /// Splits the active segment with the most remaining bytes.
    ///
    /// The split point is the midpoint of the *remaining* range, rounded
    /// down to a `min_segment_size` boundary and clamped so both halves
    /// keep at least `min_segment_size`. Only the parent's `end` field
    /// changes; its worker keeps writing undisturbed, and since
    /// `p >= cursor + min_segment_size >= cursor + buffer_size`, a chunk
    /// the parent's worker has fetched but not yet recorded can never
    /// cross into the new segment.
    ///
    /// Returns the new segment's ID, or `None` when no split is feasible.
    fn split_largest_active(&mut self) -> Option<i32> {
        // Splitting is disabled for unknown-length downloads.
        if self.file_size <= 0 {
            return None;
        }

        let (idx, _) = self
            .segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == SegmentStatus::Active)
            .max_by_key(|(_, s)| s.remaining_bytes())?;

        let parent = &self.segments[idx];
        let remaining = parent.remaining_bytes();
        if remaining < self.min_segment_size * 2 {
            return None;
        }

        let mut split_point = parent.cursor + remaining / 2;
        split_point = (split_point / self.min_segment_size) * self.min_segment_size;
        if split_point <= parent.cursor {
            split_point = parent.cursor + self.min_segment_size;
        }
        if split_point > parent.end - self.min_segment_size {
            return None;
        }

        let new_id = self.next_id;
        self.next_id += 1;

        let parent = &mut self.segments[idx];
        let old_end = parent.end;
        parent.end = split_point - 1;

        let child = Segment {
            id: new_id,
            start: split_point,
            end: old_end,
            cursor: split_point,
            owner: None,
            status: SegmentStatus::Pending,
            last_activity: Instant::now(),
            speed: 0.0,
        };

        debug!(
            parent = self.segments[idx].id,
            child = new_id,
            split_point,
            "split segment"
        );

        // Keep the list ordered by start offset.
        self.segments.insert(idx + 1, child);
        Some(new_id)
    }
}
