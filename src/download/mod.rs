//! The download engine: multi-connection transfers with dynamic
//! segmentation, crash-safe resume, and bandwidth limiting.
//!
//! # Anatomy
//!
//! - [`engine`] - public API, active-download registry, background tasks
//! - [`orchestrator`] (internal) - per-download lifecycle
//! - [`worker`] (internal) - one task per connection slot
//! - [`segment`] - the dynamic range-splitting policy
//! - [`assembler`] - positioned writes, preallocation, finalize
//! - [`resume`] - segment snapshots and server revalidation
//! - [`limiter`] - the global token bucket
//! - [`client`] / [`ftp`] - the HTTP and FTP transports
//! - [`retry`] - failure classification and backoff
//! - [`session`] / [`pool`] - request decoration and client reuse
//!
//! # Example
//!
//! ```no_run
//! use accel::download::{AddRequest, DownloadEngine, EngineEvent};
//! use accel::EngineConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = DownloadEngine::new(EngineConfig::default())?;
//! let mut events = engine.subscribe();
//!
//! let id = engine.add(AddRequest::new("https://example.com/ubuntu.iso"))?;
//! engine.start(&id)?;
//!
//! loop {
//!     match events.recv().await? {
//!         EngineEvent::Complete { id: done } if done == id => break,
//!         EngineEvent::Error { message, .. } => return Err(message.into()),
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod assembler;
pub mod checksum;
pub mod client;
mod engine;
mod error;
pub mod event;
pub mod filename;
pub mod ftp;
pub mod limiter;
mod orchestrator;
pub mod pool;
pub mod resume;
mod retry;
pub mod segment;
pub mod session;
pub mod transport;
mod worker;

pub use assembler::{finalize, set_timestamp, ConflictPolicy, PartialFile};
pub use checksum::{hash_file, verify_file, HashAlgorithm};
pub use client::{ByteStream, HttpClient, ProxyConfig, RequestConfig, RequestMethod, ResponseInfo};
pub use engine::{AddRequest, DownloadEngine, EngineError, Probe};
pub use error::DownloadError;
pub use event::{EngineEvent, EventBus};
pub use ftp::FtpClient;
pub use limiter::RateLimiter;
pub use pool::ConnectionPool;
pub use retry::{
    classify_error, parse_retry_after, retry_after_hint, FailureType, RetryDecision, RetryPolicy,
};
pub use segment::{Assignment, Segment, SegmentManager, SegmentRecord, SegmentStatus};
pub use session::{CookieStore, Credential, CredentialStore, ProxyResolver};
pub use transport::{Scheme, Transport};
