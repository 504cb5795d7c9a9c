//! Positioned-write file assembly.
//!
//! During a transfer the target exists as `<target>.partial`, pre-sized
//! to the expected length. All workers of a download share one handle
//! and write at explicit offsets; there is no shared cursor to race on,
//! and the segment manager guarantees the offset ranges never overlap.
//! Finalize renames the partial into place, resolving name conflicts by
//! policy, and stamps the server's Last-Modified time onto the result.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use super::error::DownloadError;
use super::filename::resolve_unique_path;

/// Positioned writes larger than this are split, bounding how much data
/// a single failed write can leave in doubt.
const MAX_WRITE_CHUNK: usize = 1024 * 1024;

/// What to do when the finalize target already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Pick `name (1).ext` .. `name (9999).ext`, then a timestamp suffix.
    #[default]
    AutoRename,
    /// Replace the existing file.
    Overwrite,
    /// Keep the existing file; the partial is deleted.
    Skip,
}

/// Shared handle to a partial file supporting concurrent positioned
/// writes.
///
/// Cloning is cheap; every clone writes through the same descriptor.
#[derive(Debug, Clone)]
pub struct PartialFile {
    file: Arc<std::fs::File>,
    path: PathBuf,
}

impl PartialFile {
    /// Creates or opens the partial file, pre-allocating `file_size`
    /// bytes when the file is newly created and the size is known.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] when the directory cannot be
    /// created or the file cannot be opened or sized.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>, file_size: i64) -> Result<Self, DownloadError> {
        let path = path.as_ref().to_path_buf();

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| DownloadError::io(dir, e))?;
            }
        }

        let opened = tokio::task::spawn_blocking({
            let path = path.clone();
            move || -> std::io::Result<std::fs::File> {
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)?;

                // Pre-allocate only a brand-new file; an existing
                // partial already carries resumable data.
                if file_size > 0 && file.metadata()?.len() == 0 {
                    file.set_len(file_size as u64)?;
                }
                Ok(file)
            }
        })
        .await
        .map_err(|e| DownloadError::io(&path, std::io::Error::other(e)))?
        .map_err(|e| DownloadError::io(&path, e))?;

        debug!(file_size, "partial file opened");

        Ok(Self {
            file: Arc::new(opened),
            path,
        })
    }

    /// Writes `data` at `offset` without touching any shared cursor.
    ///
    /// Safe to call concurrently from multiple workers as long as the
    /// written ranges do not overlap. Chunks above 1 MiB are split into
    /// bounded positioned writes.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] when a write fails; the partial is
    /// then in an unknown state past `offset` and the transfer must not
    /// be finalized.
    pub async fn write_at(&self, offset: u64, data: Bytes) -> Result<(), DownloadError> {
        if data.is_empty() {
            return Ok(());
        }

        let file = Arc::clone(&self.file);
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut written = 0usize;
            while written < data.len() {
                let chunk_end = (written + MAX_WRITE_CHUNK).min(data.len());
                let chunk = &data[written..chunk_end];
                write_all_at(&file, offset + written as u64, chunk)?;
                written = chunk_end;
            }
            Ok(())
        })
        .await
        .map_err(|e| DownloadError::io(&self.path, std::io::Error::other(e)))?
        .map_err(|e| DownloadError::io(path, e))
    }

    /// Flushes file data to the device.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Io`] when the sync fails.
    pub async fn sync(&self) -> Result<(), DownloadError> {
        let file = Arc::clone(&self.file);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || file.sync_data())
            .await
            .map_err(|e| DownloadError::io(&path, std::io::Error::other(e)))?
            .map_err(|e| DownloadError::io(&self.path, e))
    }

    /// Path of the partial file on disk.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn write_all_at(file: &std::fs::File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_all_at(file: &std::fs::File, mut offset: u64, mut data: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let written = file.seek_write(data, offset)?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "positioned write returned zero",
            ));
        }
        data = &data[written..];
        offset += written as u64;
    }
    Ok(())
}

/// Renames the partial into its final name, resolving conflicts by
/// `policy`. Falls back to copy + delete when the rename crosses
/// volumes. Returns the realized target path.
///
/// Idempotent under auto-rename: calling it again after the partial is
/// gone fails cleanly without disturbing the first call's output.
///
/// # Errors
///
/// Returns [`DownloadError::Io`] when neither rename nor copy succeeds.
#[instrument(skip(partial, target), fields(target = %target.display()))]
pub async fn finalize(
    partial: &Path,
    target: &Path,
    policy: ConflictPolicy,
) -> Result<PathBuf, DownloadError> {
    let final_path = if target.exists() {
        match policy {
            ConflictPolicy::AutoRename => resolve_unique_path(target),
            ConflictPolicy::Overwrite => {
                tokio::fs::remove_file(target)
                    .await
                    .map_err(|e| DownloadError::io(target, e))?;
                target.to_path_buf()
            }
            ConflictPolicy::Skip => {
                info!("target exists, skipping finalize");
                tokio::fs::remove_file(partial)
                    .await
                    .map_err(|e| DownloadError::io(partial, e))?;
                return Ok(target.to_path_buf());
            }
        }
    } else {
        target.to_path_buf()
    };

    match tokio::fs::rename(partial, &final_path).await {
        Ok(()) => {}
        Err(rename_err) => {
            // Cross-volume move: copy then delete.
            debug!(error = %rename_err, "rename failed, trying copy+delete");
            tokio::fs::copy(partial, &final_path)
                .await
                .map_err(|e| DownloadError::io(&final_path, e))?;
            tokio::fs::remove_file(partial)
                .await
                .map_err(|e| DownloadError::io(partial, e))?;
        }
    }

    info!(path = %final_path.display(), "download finalized");
    Ok(final_path)
}

/// Applies an HTTP-format date string as the file's modification time.
/// Silently no-ops when the date does not parse.
pub fn set_timestamp(path: &Path, http_date: &str) {
    if http_date.is_empty() {
        return;
    }
    let Ok(modified) = httpdate::parse_http_date(http_date) else {
        debug!(http_date, "unparseable Last-Modified, leaving mtime");
        return;
    };
    if let Err(error) = filetime::set_file_mtime(path, filetime::FileTime::from_system_time(modified))
    {
        warn!(%error, "failed to apply file timestamp");
    }
}
