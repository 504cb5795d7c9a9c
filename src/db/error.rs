//! Error types for the database module.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while operating the download database.
#[derive(Debug, Error)]
pub enum DbError {
    /// File system error reading or writing the snapshot or journal.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The snapshot file did not start with the expected header.
    #[error("invalid database format in {path}: {detail}")]
    InvalidFormat {
        /// The snapshot file.
        path: PathBuf,
        /// What was wrong.
        detail: String,
    },

    /// Lookup for an ID that is not in the catalog.
    #[error("entry not found: {id}")]
    NotFound {
        /// The missing ID.
        id: String,
    },
}

impl DbError {
    /// Creates an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a format error with path context.
    pub fn invalid_format(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::InvalidFormat {
            path: path.into(),
            detail: detail.into(),
        }
    }
}
