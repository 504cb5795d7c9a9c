//! Connection worker: one task per connection slot of a download.
//!
//! A worker loops asking the segment manager for work, streams the
//! assigned byte range, and writes it positionally while gating every
//! block through the global rate limiter. It carries its own assignment
//! and write cursor, so the segment map lock is only touched by the
//! short progress updates. Transient failures are retried with
//! exponential backoff; a permanent failure records the cause and ends
//! the worker.
//!
//! Overlap safety across a split: the worker records progress after
//! every block of at most `buffer_size` bytes, and the split point is
//! always at least `min_segment_size >= buffer_size` ahead of the
//! recorded cursor - so an in-flight block can never reach into a
//! freshly split-off segment, and the refreshed `end` from the next
//! progress update stops the worker before the boundary.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::assembler::PartialFile;
use super::client::RequestConfig;
use super::error::DownloadError;
use super::limiter::RateLimiter;
use super::orchestrator::ActiveDownload;
use super::retry::{classify_error, retry_after_hint, FailureType, RetryDecision, RetryPolicy};
use super::segment::{Assignment, SegmentManager, UNKNOWN_END};
use super::transport::Transport;

/// Poll cadence for the pause gate and interruptible backoff sleeps.
const SIGNAL_POLL: Duration = Duration::from_millis(100);

/// Everything one worker needs, bundled at dispatch time.
pub(crate) struct WorkerEnv {
    /// Connection slot index within the download.
    pub worker_id: usize,
    /// Shared per-download state (flags, failure record).
    pub active: Arc<ActiveDownload>,
    /// The download's segment map.
    pub segments: Arc<SegmentManager>,
    /// Shared positioned-write handle.
    pub partial: PartialFile,
    /// Protocol client for this download.
    pub transport: Arc<dyn Transport>,
    /// Global rate limiter.
    pub limiter: Arc<RateLimiter>,
    /// Request decoration template; range fields are filled per
    /// assignment.
    pub template: RequestConfig,
    /// Retry policy for this download.
    pub retry_policy: RetryPolicy,
    /// Block size for limiter gating and progress recording.
    pub buffer_size: usize,
}

/// Runs the worker loop until cancelled, out of work, or out of retries.
#[instrument(skip(env), fields(download = %env.active.id(), worker = env.worker_id))]
pub(crate) async fn run_worker(env: WorkerEnv) {
    let mut attempts = 0u32;

    loop {
        if env.active.is_cancelled() {
            break;
        }

        let Some(assignment) = env.segments.request_segment(env.worker_id) else {
            debug!("no work available, exiting");
            break;
        };

        // Pause gate: wait for resume or cancellation before opening a
        // connection.
        while env.active.is_paused() && !env.active.is_cancelled() {
            tokio::time::sleep(SIGNAL_POLL).await;
        }
        if env.active.is_cancelled() {
            env.segments.release(assignment.segment_id);
            break;
        }

        match fetch_assignment(&env, assignment).await {
            Ok(()) => {
                attempts = 0;
            }
            Err(DownloadError::Cancelled) => {
                env.segments.release(assignment.segment_id);
                break;
            }
            Err(error) => {
                env.segments.mark_error(assignment.segment_id);
                let failure_type = classify_error(&error);
                env.active.record_failure(error.to_string());

                if failure_type == FailureType::Permanent {
                    warn!(%error, "permanent failure, worker exiting");
                    env.active.flag_permanent_failure();
                    break;
                }

                attempts += 1;
                // Any transient status can carry a Retry-After hint;
                // the lookup yields None when the header was absent.
                let hint = retry_after_hint(&error);

                match env.retry_policy.should_retry(failure_type, attempts) {
                    RetryDecision::Retry { delay, attempt } => {
                        let delay = hint.unwrap_or(delay);
                        info!(
                            %error,
                            attempt,
                            max_attempts = env.retry_policy.max_attempts(),
                            delay_ms = delay.as_millis(),
                            "retrying after failure"
                        );
                        if !sleep_interruptible(&env, delay).await {
                            break;
                        }
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        warn!(%error, %reason, "giving up");
                        break;
                    }
                }
            }
        }
    }
}

/// Streams one assignment into the partial file.
///
/// Returns `Ok(())` when the segment completed, [`DownloadError::Cancelled`]
/// when a pause/cancel signal aborted the stream, or the underlying
/// failure otherwise.
async fn fetch_assignment(env: &WorkerEnv, assignment: Assignment) -> Result<(), DownloadError> {
    let unknown_size = assignment.end == UNKNOWN_END;

    let mut config = env.template.clone();
    if unknown_size && assignment.start == 0 {
        // Single-connection, size-less transfer: plain request.
        config.range_start = -1;
        config.range_end = -1;
    } else {
        config.range_start = assignment.start;
        config.range_end = if unknown_size { -1 } else { assignment.end };
    }

    let (_info, mut stream) = env.transport.fetch(&config).await?;

    let mut cursor = assignment.start;
    let mut segment_end = assignment.end;
    let mut window_bytes: u64 = 0;
    let mut window_start = Instant::now();
    let mut finished = false;

    'stream: while let Some(chunk) = stream.next().await {
        let chunk = chunk?;

        if env.active.is_cancelled() || env.active.is_paused() {
            return Err(DownloadError::Cancelled);
        }

        let mut offset = 0usize;
        while offset < chunk.len() {
            let segment_remaining = if segment_end == UNKNOWN_END {
                usize::MAX
            } else {
                usize::try_from(segment_end - cursor + 1).unwrap_or(0)
            };
            if segment_remaining == 0 {
                finished = true;
                break 'stream;
            }

            let want = (chunk.len() - offset)
                .min(env.buffer_size)
                .min(segment_remaining);
            let permitted = env.limiter.request(want).await;

            if env.active.is_cancelled() || env.active.is_paused() {
                return Err(DownloadError::Cancelled);
            }

            let block = chunk.slice(offset..offset + permitted);
            env.partial
                .write_at(cursor as u64, block)
                .await?;

            window_bytes += permitted as u64;
            let elapsed = window_start.elapsed();
            let speed = if elapsed >= Duration::from_secs(1) {
                let sample = window_bytes as f64 / elapsed.as_secs_f64();
                window_bytes = 0;
                window_start = Instant::now();
                sample
            } else {
                0.0
            };

            let Some(update) =
                env.segments
                    .update_progress(assignment.segment_id, permitted as i64, speed)
            else {
                // Segment vanished from the map; treat as done.
                finished = true;
                break 'stream;
            };

            cursor += permitted as i64;
            offset += permitted;
            segment_end = update.end;

            if update.complete {
                finished = true;
                break 'stream;
            }
        }
    }

    if unknown_size {
        // EOF defines the file size for a size-less transfer.
        let size = env.segments.truncate_to_cursor(assignment.segment_id);
        debug!(size, "unknown-length transfer finished at EOF");
        return Ok(());
    }

    if !finished && cursor <= segment_end {
        // The server closed the connection before delivering the range.
        return Err(DownloadError::Incomplete {
            url: config.url.clone(),
            expected: segment_end - assignment.start + 1,
            received: cursor - assignment.start,
        });
    }

    env.segments.mark_complete(assignment.segment_id);
    Ok(())
}

/// Sleeps in short slices, returning false when cancelled mid-sleep.
async fn sleep_interruptible(env: &WorkerEnv, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if env.active.is_cancelled() {
            return false;
        }
        let remaining = deadline - Instant::now();
        tokio::time::sleep(remaining.min(SIGNAL_POLL)).await;
    }
    !env.active.is_cancelled()
}
