//! Engine configuration record.
//!
//! The engine consumes a single [`EngineConfig`] value constructed by the
//! embedding application; preference persistence, dialogs, and similar UI
//! concerns live outside this crate.

use std::path::PathBuf;

use thiserror::Error;

/// Minimum allowed per-download connection count.
pub const MIN_CONNECTIONS: u32 = 1;

/// Maximum allowed per-download connection count.
pub const MAX_CONNECTIONS: u32 = 32;

/// Default per-download connection count.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 8;

/// Default worker retry ceiling per segment assignment.
pub const DEFAULT_RETRY_COUNT: u32 = 20;

/// Default base delay for worker retry backoff (seconds).
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;

/// Default per-chunk read buffer (64 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default splitting floor for the segment manager (64 KiB).
pub const DEFAULT_MIN_SEGMENT_SIZE: i64 = 64 * 1024;

/// Default user agent sent with every request.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Connection count outside 1..=32.
    #[error(
        "invalid default_max_connections {value}: must be between {MIN_CONNECTIONS} and {MAX_CONNECTIONS}"
    )]
    InvalidConnections {
        /// The rejected value.
        value: u32,
    },

    /// The read buffer must not exceed the segment floor, otherwise a
    /// worker could have more unrecorded in-flight bytes than a split
    /// leaves in front of it.
    #[error("buffer_size {buffer} exceeds min_segment_size {min_segment}")]
    BufferExceedsSegmentFloor {
        /// Configured buffer size.
        buffer: usize,
        /// Configured segment floor.
        min_segment: i64,
    },

    /// Zero-valued interval that the engine divides by.
    #[error("interval option `{option}` must be non-zero")]
    ZeroInterval {
        /// Name of the offending option.
        option: &'static str,
    },
}

/// Settings record consumed by the download engine.
///
/// All durations are plain integers in the unit named by the field so the
/// record can be populated from any frontend configuration source.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for the database, journal, and logs.
    pub data_dir: PathBuf,
    /// Default target directory for new downloads.
    pub default_save_dir: PathBuf,
    /// Default per-download worker count (1..=32).
    pub default_max_connections: u32,
    /// HTTP connect timeout in seconds.
    pub default_timeout_secs: u64,
    /// HTTP receive timeout in seconds; a stall longer than this is a
    /// transient error.
    pub receive_timeout_secs: u64,
    /// Worker retry ceiling per segment assignment.
    pub default_retry_count: u32,
    /// Base delay for exponential retry backoff, in seconds.
    pub retry_base_delay_secs: u64,
    /// Per-chunk read buffer in bytes.
    pub buffer_size: usize,
    /// Segment splitting floor in bytes.
    pub min_segment_size: i64,
    /// Segment snapshot cadence in milliseconds.
    pub segment_save_interval_ms: u64,
    /// Speed aggregator cadence in milliseconds.
    pub speed_sample_interval_ms: u64,
    /// Default user-agent string.
    pub user_agent: String,
    /// Global rate cap in bytes per second; 0 disables limiting.
    pub rate_limit_bps: u64,
    /// Redirect-following cap per request.
    pub max_redirects: usize,
    /// Verify TLS certificates.
    pub verify_tls: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            default_save_dir: PathBuf::from("."),
            default_max_connections: DEFAULT_MAX_CONNECTIONS,
            default_timeout_secs: 30,
            receive_timeout_secs: 60,
            default_retry_count: DEFAULT_RETRY_COUNT,
            retry_base_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            min_segment_size: DEFAULT_MIN_SEGMENT_SIZE,
            segment_save_interval_ms: 15_000,
            speed_sample_interval_ms: 1_000,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            rate_limit_bps: 0,
            max_redirects: 10,
            verify_tls: true,
        }
    }
}

impl EngineConfig {
    /// Validates the configuration against engine constraints.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CONNECTIONS..=MAX_CONNECTIONS).contains(&self.default_max_connections) {
            return Err(ConfigError::InvalidConnections {
                value: self.default_max_connections,
            });
        }
        if self.buffer_size as i64 > self.min_segment_size {
            return Err(ConfigError::BufferExceedsSegmentFloor {
                buffer: self.buffer_size,
                min_segment: self.min_segment_size,
            });
        }
        if self.segment_save_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval {
                option: "segment_save_interval_ms",
            });
        }
        if self.speed_sample_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval {
                option: "speed_sample_interval_ms",
            });
        }
        Ok(())
    }

    /// Clamps a requested per-download connection count into the valid range.
    #[must_use]
    pub fn clamp_connections(requested: u32) -> u32 {
        requested.clamp(MIN_CONNECTIONS, MAX_CONNECTIONS)
    }

    /// Path of the download database inside `data_dir`.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("downloads.db")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_max_connections, 8);
        assert_eq!(config.buffer_size, 65536);
        assert_eq!(config.min_segment_size, 65536);
        assert_eq!(config.segment_save_interval_ms, 15_000);
    }

    #[test]
    fn test_invalid_connection_count_rejected() {
        let config = EngineConfig {
            default_max_connections: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConnections { value: 0 })
        ));

        let config = EngineConfig {
            default_max_connections: 33,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buffer_larger_than_segment_floor_rejected() {
        let config = EngineConfig {
            buffer_size: 128 * 1024,
            min_segment_size: 64 * 1024,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BufferExceedsSegmentFloor { .. })
        ));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = EngineConfig {
            segment_save_interval_ms: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_clamp_connections() {
        assert_eq!(EngineConfig::clamp_connections(0), 1);
        assert_eq!(EngineConfig::clamp_connections(8), 8);
        assert_eq!(EngineConfig::clamp_connections(100), 32);
    }

    #[test]
    fn test_database_path_under_data_dir() {
        let config = EngineConfig {
            data_dir: PathBuf::from("/tmp/accel"),
            ..EngineConfig::default()
        };
        assert_eq!(config.database_path(), PathBuf::from("/tmp/accel/downloads.db"));
    }
}
