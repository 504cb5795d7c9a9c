//! Integrity verification for finished downloads.
//!
//! Hashes are computed by streaming the file in fixed-size chunks, so
//! memory use stays constant regardless of file size. A mismatch after
//! finalize is non-fatal by policy: the orchestrator logs it and
//! completes the entry with a warning.

use std::path::{Path, PathBuf};

use md5::{Digest as _, Md5};
use sha1::Sha1;
use sha2::Sha256;
use tracing::{debug, instrument};

use super::DownloadError;

/// Read granularity for streaming hashes.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Supported hash algorithms, tagged as stored in `checksumType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// MD5 (legacy mirrors still publish these).
    Md5,
    /// SHA-1.
    Sha1,
    /// SHA-256.
    Sha256,
}

impl HashAlgorithm {
    /// Parses a `checksumType` tag, case-insensitive.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "md5" => Some(Self::Md5),
            "sha1" | "sha-1" => Some(Self::Sha1),
            "sha256" | "sha-256" => Some(Self::Sha256),
            _ => None,
        }
    }

    /// Canonical tag for persistence.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }
}

/// Computes the hex digest of a file.
///
/// The read loop runs on the blocking pool; large files do not stall the
/// async runtime.
///
/// # Errors
///
/// Returns [`DownloadError::Io`] when the file cannot be read.
#[instrument(skip(path), fields(path = %path.as_ref().display()))]
pub async fn hash_file(
    path: impl AsRef<Path>,
    algorithm: HashAlgorithm,
) -> Result<String, DownloadError> {
    let path: PathBuf = path.as_ref().to_path_buf();
    let result = tokio::task::spawn_blocking(move || hash_file_sync(&path, algorithm)).await;

    match result {
        Ok(digest) => digest,
        Err(join_error) => Err(DownloadError::io(
            PathBuf::new(),
            std::io::Error::other(join_error),
        )),
    }
}

fn hash_file_sync(path: &Path, algorithm: HashAlgorithm) -> Result<String, DownloadError> {
    use std::io::Read;

    let mut file = std::fs::File::open(path).map_err(|e| DownloadError::io(path, e))?;
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    // One loop per algorithm keeps the hasher monomorphic.
    macro_rules! stream_digest {
        ($hasher:expr) => {{
            let mut hasher = $hasher;
            loop {
                let n = file.read(&mut buffer).map_err(|e| DownloadError::io(path, e))?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            hex::encode(hasher.finalize())
        }};
    }

    let digest = match algorithm {
        HashAlgorithm::Md5 => stream_digest!(Md5::new()),
        HashAlgorithm::Sha1 => stream_digest!(Sha1::new()),
        HashAlgorithm::Sha256 => stream_digest!(Sha256::new()),
    };

    Ok(digest)
}

/// Verifies a file against an expected hex digest, case-insensitive.
///
/// # Errors
///
/// Returns [`DownloadError::Io`] when the file cannot be read; a
/// mismatch is reported through the `Ok(false)` arm, not as an error.
pub async fn verify_file(
    path: impl AsRef<Path>,
    expected_hex: &str,
    algorithm: HashAlgorithm,
) -> Result<bool, DownloadError> {
    let actual = hash_file(path, algorithm).await?;
    let matches = actual.eq_ignore_ascii_case(expected_hex.trim());
    debug!(matches, algorithm = algorithm.tag(), "checksum verified");
    Ok(matches)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_algorithm_tags() {
        assert_eq!(HashAlgorithm::parse("md5"), Some(HashAlgorithm::Md5));
        assert_eq!(HashAlgorithm::parse("SHA1"), Some(HashAlgorithm::Sha1));
        assert_eq!(HashAlgorithm::parse("sha-256"), Some(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::parse(" sha256 "), Some(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::parse("crc32"), None);
    }

    #[tokio::test]
    async fn test_known_digests() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();

        assert_eq!(
            hash_file(&path, HashAlgorithm::Md5).await.unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            hash_file(&path, HashAlgorithm::Sha1).await.unwrap(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            hash_file(&path, HashAlgorithm::Sha256).await.unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_verify_case_insensitive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();

        let ok = verify_file(
            &path,
            "900150983CD24FB0D6963F7D28E17F72",
            HashAlgorithm::Md5,
        )
        .await
        .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn test_verify_mismatch_is_ok_false() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("abc.txt");
        std::fs::write(&path, b"abc").unwrap();

        let ok = verify_file(&path, "deadbeef", HashAlgorithm::Md5).await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let result = hash_file("/nonexistent/file.bin", HashAlgorithm::Sha256).await;
        assert!(matches!(result, Err(DownloadError::Io { .. })));
    }

    #[tokio::test]
    async fn test_large_file_spans_multiple_buffers() {
        use sha2::Digest;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        let data = vec![0x5au8; 3 * HASH_BUFFER_SIZE + 17];
        std::fs::write(&path, &data).unwrap();

        let streamed = hash_file(&path, HashAlgorithm::Sha256).await.unwrap();
        let direct = hex::encode(Sha256::digest(&data));
        assert_eq!(streamed, direct);
    }
}
