//! Retry logic with exponential backoff for transient transfer failures.
//!
//! When a segment fetch fails, the error is classified into a
//! [`FailureType`]:
//! - [`FailureType::Transient`] - temporary failures retried with backoff
//! - [`FailureType::Permanent`] - failures that no retry can fix
//!
//! The [`RetryPolicy`] computes the delay for attempt `n` as
//! `base * 2^(n-1)` seconds, capped at 300 seconds, plus a small random
//! jitter so parallel workers do not retry in lockstep. Whenever a
//! transient response carries a `Retry-After` header, that server hint
//! takes precedence over the computed delay.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

use super::DownloadError;

/// Backoff cap (5 minutes).
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Maximum jitter added to delays (500 ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Maximum honored Retry-After value (1 hour).
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Classification of transfer failures for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: timeouts, connection errors, DNS failure,
    /// 408/429/500/502/503/504/509 statuses.
    Transient,

    /// Failure that will not succeed regardless of retries.
    ///
    /// Examples: 401/403/404/410, filesystem errors, invalid URLs.
    Permanent,
}

/// Decision on whether to retry a failed segment assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// The attempt number the retry will be (1-indexed).
        attempt: u32,
    },

    /// Give up.
    DoNotRetry {
        /// Human-readable reason.
        reason: String,
    },
}

/// Exponential backoff configuration for worker retries.
///
/// Delay formula: `min(base * 2^(attempt-1), 300s) + jitter`.
/// With the default 5 second base the ladder is 5s, 10s, 20s, 40s, ...
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::DEFAULT_RETRY_COUNT,
            base_delay: Duration::from_secs(crate::config::DEFAULT_RETRY_DELAY_SECS),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with an explicit attempt ceiling and base delay.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Returns the attempt ceiling.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether a failed attempt should be retried.
    ///
    /// `attempt` is the 1-indexed attempt that just failed.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.delay_for_attempt(attempt) + jitter();

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Backoff delay for a 1-indexed attempt, without jitter:
    /// `base * 2^(attempt-1)` capped at 300 seconds.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(8);
        let delay = self.base_delay.saturating_mul(1 << exponent);
        delay.min(MAX_RETRY_DELAY)
    }
}

/// Random jitter in `[0, 500ms]` to spread out simultaneous retries.
fn jitter() -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..=MAX_JITTER.as_millis() as u64))
}

/// Classifies a transfer error into a failure type.
///
/// # HTTP Status Classification
///
/// | Status | Type |
/// |--------|------|
/// | 401, 403, 404, 410 | Permanent |
/// | 408, 429, 500, 502, 503, 504, 509 | Transient |
/// | other 4xx | Permanent |
/// | other 5xx | Transient |
///
/// Non-HTTP errors: timeouts and network failures are transient;
/// filesystem errors, invalid URLs, redirect storms, and unhonored
/// ranges are permanent. FTP protocol errors are transient unless the
/// server reply is a permanent-negative (5xx) code.
#[instrument]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),

        DownloadError::Timeout { .. } => FailureType::Transient,

        DownloadError::Network { .. } => FailureType::Transient,

        // The server closed mid-range; the next attempt resumes at the
        // cursor.
        DownloadError::Incomplete { .. } => FailureType::Transient,

        DownloadError::Ftp { detail, .. } => {
            // FTP permanent-negative replies start with 5.
            if detail.starts_with('5') {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }

        DownloadError::Io { .. }
        | DownloadError::InvalidUrl { .. }
        | DownloadError::RedirectStorm { .. }
        | DownloadError::RangeNotHonored { .. }
        | DownloadError::Cancelled => FailureType::Permanent,
    }
}

/// Classifies an HTTP status code into a failure type.
#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        401 => FailureType::Permanent, // Unauthorized
        403 => FailureType::Permanent, // Forbidden
        404 => FailureType::Permanent, // Not Found
        408 => FailureType::Transient, // Request Timeout
        410 => FailureType::Permanent, // Gone
        429 => FailureType::Transient, // Too Many Requests
        500 => FailureType::Transient, // Internal Server Error
        502 => FailureType::Transient, // Bad Gateway
        503 => FailureType::Transient, // Service Unavailable
        504 => FailureType::Transient, // Gateway Timeout
        509 => FailureType::Transient, // Bandwidth Limit Exceeded

        status if (400..500).contains(&status) => FailureType::Permanent,
        status if (500..600).contains(&status) => FailureType::Transient,

        _ => FailureType::Permanent,
    }
}

/// Extracts a usable Retry-After delay from an error, if any.
///
/// Supports both RFC 7231 forms: integer seconds and HTTP-date. Values
/// beyond one hour are capped.
#[must_use]
pub fn retry_after_hint(error: &DownloadError) -> Option<Duration> {
    let DownloadError::HttpStatus {
        retry_after: Some(value),
        ..
    } = error
    else {
        return None;
    };

    parse_retry_after(value)
}

/// Parses a Retry-After header value into a duration.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }
        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);
        if duration > MAX_RETRY_AFTER {
            warn!(seconds, "Retry-After exceeds maximum, capping at 1 hour");
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        let now = std::time::SystemTime::now();
        return match datetime.duration_since(now) {
            Ok(duration) if duration > MAX_RETRY_AFTER => Some(MAX_RETRY_AFTER),
            Ok(duration) => Some(duration),
            // Date already in the past.
            Err(_) => Some(Duration::ZERO),
        };
    }

    debug!(header_value, "unparseable Retry-After value");
    None
}
