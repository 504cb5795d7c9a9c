//! Durable download catalog with journalled persistence.
//!
//! The catalog is an in-memory map flushed to a line-oriented text
//! snapshot (see [`format`]). Crash safety comes from a write-ahead
//! journal: every mutation appends a one-line `OP|id|name` record to
//! `<db>.journal` before the in-memory map changes, and `flush` rewrites
//! the snapshot atomically (temp file + rename) before truncating the
//! journal. A journal found at open time means a write was in progress
//! when the process died; the next flush performs a full rewrite.
//!
//! # Example
//!
//! ```no_run
//! use accel::db::{Database, DownloadEntry};
//! use std::path::Path;
//!
//! # fn example() -> Result<(), accel::db::DbError> {
//! let db = Database::open(Path::new("downloads.db"))?;
//! let mut entry = DownloadEntry::new("https://example.com/file.iso");
//! let id = db.add(&mut entry)?;
//! db.flush()?;
//! # Ok(())
//! # }
//! ```

mod entry;
mod error;
mod format;

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, instrument, warn};

pub use entry::{DownloadEntry, DownloadStatus, SegmentInfo};
pub use error::DbError;

/// Thread-safe download catalog.
///
/// All methods take `&self`; the catalog is guarded by a single mutex and
/// is safe to share behind an `Arc` across tasks. Snapshot and journal
/// writes happen under the catalog lock but never under any other engine
/// lock.
#[derive(Debug)]
pub struct Database {
    state: Mutex<DbState>,
}

#[derive(Debug)]
struct DbState {
    db_path: PathBuf,
    journal_path: PathBuf,
    entries: BTreeMap<String, DownloadEntry>,
    dirty: bool,
}

impl Database {
    /// Opens or creates the catalog at the given path.
    ///
    /// An existing snapshot is loaded into memory. A leftover journal
    /// marks the catalog dirty so the next flush rewrites the snapshot in
    /// full (bounded crash recovery).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Io`] when the directory cannot be created or
    /// the snapshot cannot be read, and [`DbError::InvalidFormat`] when
    /// the snapshot header is wrong.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub fn open(db_path: &Path) -> Result<Self, DbError> {
        let journal_path = journal_path_for(db_path);

        if let Some(dir) = db_path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).map_err(|e| DbError::io(dir, e))?;
            }
        }

        let mut dirty = false;
        if journal_path.exists() {
            warn!("journal found at open - snapshot rewrite scheduled");
            dirty = true;
        }

        let entries = if db_path.exists() {
            let text =
                fs::read_to_string(db_path).map_err(|e| DbError::io(db_path, e))?;
            let entries = format::parse(&text, db_path)?;
            info!(count = entries.len(), "database loaded");
            entries
        } else {
            debug!("creating new database");
            BTreeMap::new()
        };

        let db = Self {
            state: Mutex::new(DbState {
                db_path: db_path.to_path_buf(),
                journal_path,
                entries,
                dirty,
            }),
        };

        // Make sure a fresh catalog exists on disk immediately.
        if !db_path.exists() {
            db.flush_inner(&mut db.lock())?;
        }

        Ok(db)
    }

    /// Adds a new entry, assigning an ID when the entry has none.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Io`] when the journal record cannot be written.
    pub fn add(&self, entry: &mut DownloadEntry) -> Result<String, DbError> {
        let mut state = self.lock();

        if entry.id.is_empty() {
            entry.id = DownloadEntry::generate_id();
        }

        write_journal(&state.journal_path, "ADD", &entry.id, &entry.file_name)?;

        state.entries.insert(entry.id.clone(), entry.clone());
        state.dirty = true;

        debug!(id = %entry.id, file = %entry.file_name, "entry added");
        Ok(entry.id.clone())
    }

    /// Replaces an existing entry.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for unknown IDs and [`DbError::Io`]
    /// when the journal record cannot be written.
    pub fn update(&self, entry: &DownloadEntry) -> Result<(), DbError> {
        let mut state = self.lock();

        if !state.entries.contains_key(&entry.id) {
            return Err(DbError::NotFound {
                id: entry.id.clone(),
            });
        }

        write_journal(&state.journal_path, "UPDATE", &entry.id, &entry.file_name)?;

        state.entries.insert(entry.id.clone(), entry.clone());
        state.dirty = true;
        Ok(())
    }

    /// Fast-path progress update touching only the downloaded/speed/
    /// segment fields. Skips the journal; a lost progress sample is
    /// reconstructed from the segment snapshot on resume.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for unknown IDs.
    pub fn update_progress(
        &self,
        id: &str,
        downloaded_bytes: i64,
        speed: f64,
        segments: Vec<SegmentInfo>,
    ) -> Result<(), DbError> {
        let mut state = self.lock();

        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| DbError::NotFound { id: id.to_string() })?;

        entry.downloaded_bytes = downloaded_bytes;
        entry.record_speed(speed);
        entry.segments = segments;
        state.dirty = true;
        Ok(())
    }

    /// Removes an entry, optionally deleting its on-disk artifacts
    /// (target file, partial, segment snapshot).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] for unknown IDs and [`DbError::Io`]
    /// when the journal record cannot be written.
    #[instrument(skip(self))]
    pub fn remove(&self, id: &str, delete_files: bool) -> Result<DownloadEntry, DbError> {
        let mut state = self.lock();

        let Some(entry) = state.entries.get(id).cloned() else {
            return Err(DbError::NotFound { id: id.to_string() });
        };

        write_journal(&state.journal_path, "REMOVE", id, &entry.file_name)?;

        if delete_files {
            // Best effort; a missing file is not an error here.
            let _ = fs::remove_file(entry.full_path());
            let _ = fs::remove_file(entry.partial_path());
            let _ = fs::remove_file(entry.segment_path());
        }

        state.entries.remove(id);
        state.dirty = true;

        info!(id, file = %entry.file_name, "entry removed");
        Ok(entry)
    }

    /// Returns a clone of the entry for an ID.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<DownloadEntry> {
        self.lock().entries.get(id).cloned()
    }

    /// Returns all entries.
    #[must_use]
    pub fn list(&self) -> Vec<DownloadEntry> {
        self.lock().entries.values().cloned().collect()
    }

    /// Returns entries in a given status.
    #[must_use]
    pub fn list_by_status(&self, status: DownloadStatus) -> Vec<DownloadEntry> {
        self.lock()
            .entries
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect()
    }

    /// Returns entries in a given category.
    #[must_use]
    pub fn list_by_category(&self, category: &str) -> Vec<DownloadEntry> {
        self.lock()
            .entries
            .values()
            .filter(|e| e.category == category)
            .cloned()
            .collect()
    }

    /// Counts entries in a given status.
    #[must_use]
    pub fn count_by_status(&self, status: DownloadStatus) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| e.status == status)
            .count()
    }

    /// Total number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// True when the catalog holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Removes every completed entry; returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Io`] when a journal record cannot be written.
    pub fn remove_completed(&self, delete_files: bool) -> Result<usize, DbError> {
        let completed: Vec<String> = self
            .list_by_status(DownloadStatus::Complete)
            .into_iter()
            .map(|e| e.id)
            .collect();

        for id in &completed {
            self.remove(id, delete_files)?;
        }
        Ok(completed.len())
    }

    /// Rewrites the snapshot atomically and truncates the journal.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Io`] when the snapshot cannot be written or
    /// renamed into place.
    #[instrument(skip(self))]
    pub fn flush(&self) -> Result<(), DbError> {
        let mut state = self.lock();
        self.flush_inner(&mut state)
    }

    fn flush_inner(&self, state: &mut DbState) -> Result<(), DbError> {
        if !state.dirty && state.db_path.exists() {
            return Ok(());
        }

        let text = format::serialize(&state.entries);
        let tmp_path = state.db_path.with_extension("db.tmp");

        fs::write(&tmp_path, text).map_err(|e| DbError::io(&tmp_path, e))?;
        fs::rename(&tmp_path, &state.db_path).map_err(|e| DbError::io(&state.db_path, e))?;

        // A committed snapshot supersedes the journal.
        let _ = fs::remove_file(&state.journal_path);
        state.dirty = false;

        debug!(count = state.entries.len(), "database flushed");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DbState> {
        // A poisoned catalog lock means a writer panicked mid-mutation;
        // the on-disk journal covers that case, so keep serving.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// `<db>.journal`, next to the snapshot.
fn journal_path_for(db_path: &Path) -> PathBuf {
    let mut path = db_path.as_os_str().to_os_string();
    path.push(".journal");
    PathBuf::from(path)
}

/// Appends one `OP|id|name` record and flushes it before the caller
/// mutates the in-memory map.
fn write_journal(journal_path: &Path, op: &str, id: &str, name: &str) -> Result<(), DbError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(journal_path)
        .map_err(|e| DbError::io(journal_path, e))?;

    writeln!(file, "{op}|{id}|{name}").map_err(|e| DbError::io(journal_path, e))?;
    file.flush().map_err(|e| DbError::io(journal_path, e))?;
    Ok(())
}
