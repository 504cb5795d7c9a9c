//! The download engine: public API, active-download registry, and the
//! engine-lifetime background tasks.
//!
//! All engine-wide collaborators (catalog, rate limiter, connection
//! pool, cookie/credential/proxy stores, event bus) are constructed
//! once and owned here; nothing in the engine reaches for hidden
//! globals, so several engines can coexist in one process (tests do
//! exactly that).
//!
//! # Example
//!
//! ```no_run
//! use accel::download::{AddRequest, DownloadEngine};
//! use accel::EngineConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = DownloadEngine::new(EngineConfig::default())?;
//! let mut events = engine.subscribe();
//!
//! let id = engine.add(AddRequest::new("https://example.com/big.iso"))?;
//! engine.start(&id)?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::db::{Database, DbError, DownloadEntry, DownloadStatus};

use super::client::ResponseInfo;
use super::error::DownloadError;
use super::event::{EngineEvent, EventBus};
use super::filename;
use super::limiter::RateLimiter;
use super::orchestrator::{self, ActiveDownload};
use super::pool::ConnectionPool;
use super::session::{CookieStore, CredentialStore, ProxyResolver};
use super::transport::{Scheme, Transport};

/// How long `remove` and `shutdown` wait for orchestrators to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll cadence while waiting for a drain.
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Errors surfaced by the engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Catalog failure.
    #[error("database error: {0}")]
    Db(#[from] DbError),

    /// Unknown download ID.
    #[error("download not found: {id}")]
    NotFound {
        /// The missing ID.
        id: String,
    },

    /// The download is already running.
    #[error("download already active: {id}")]
    AlreadyActive {
        /// The active ID.
        id: String,
    },

    /// The URL cannot be transferred by this engine.
    #[error("unsupported or invalid URL: {url}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
    },
}

/// Parameters for adding a new download.
#[derive(Debug, Clone)]
pub struct AddRequest {
    /// Source URL (http, https, or ftp).
    pub url: String,
    /// Target file name; derived from the server/URL when empty.
    pub file_name: Option<String>,
    /// Target directory; engine default when empty.
    pub save_dir: Option<PathBuf>,
    /// Referrer sent with every request.
    pub referrer: Option<String>,
    /// Cookie header override.
    pub cookies: Option<String>,
    /// Requested connection count; engine default when empty.
    pub num_connections: Option<u32>,
    /// Expected hash as `(hex, algorithm-tag)`.
    pub checksum: Option<(String, String)>,
    /// Free-form description.
    pub description: Option<String>,
}

impl AddRequest {
    /// A request for a URL with all defaults.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            file_name: None,
            save_dir: None,
            referrer: None,
            cookies: None,
            num_connections: None,
            checksum: None,
            description: None,
        }
    }
}

/// Probe result exposed to the UI layer.
#[derive(Debug, Clone)]
pub struct Probe {
    /// Raw response metadata.
    pub info: ResponseInfo,
    /// Filename the engine would pick.
    pub suggested_name: String,
    /// Category derived from that name.
    pub category: String,
}

/// Engine-wide shared state. One per engine; orchestrators and
/// background tasks hold it behind an `Arc`.
#[derive(Debug)]
pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) database: Arc<Database>,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) cookies: Arc<CookieStore>,
    pub(crate) credentials: Arc<CredentialStore>,
    pub(crate) proxies: Arc<ProxyResolver>,
    pub(crate) events: EventBus,
    pub(crate) active: Mutex<HashMap<String, Arc<ActiveDownload>>>,
    pub(crate) running: AtomicBool,
}

impl EngineInner {
    pub(crate) fn register(&self, active: Arc<ActiveDownload>) {
        lock(&self.active).insert(active.id().to_string(), active);
    }

    pub(crate) fn deregister(&self, id: &str) {
        lock(&self.active).remove(id);
    }

    pub(crate) fn lookup(&self, id: &str) -> Option<Arc<ActiveDownload>> {
        lock(&self.active).get(id).cloned()
    }

    pub(crate) fn active_list(&self) -> Vec<Arc<ActiveDownload>> {
        lock(&self.active).values().cloned().collect()
    }
}

/// The core download engine.
///
/// Cheap to clone; all clones drive the same engine.
#[derive(Debug, Clone)]
pub struct DownloadEngine {
    inner: Arc<EngineInner>,
    background: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl DownloadEngine {
    /// Builds an engine from a configuration record, opening the
    /// catalog and starting the background speed aggregator and state
    /// snapshotter.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for invalid settings and
    /// [`EngineError::Db`] when the catalog cannot be opened.
    #[instrument(skip(config), fields(data_dir = %config.data_dir.display()))]
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let database = Arc::new(Database::open(&config.database_path())?);
        let limiter = Arc::new(RateLimiter::new(config.rate_limit_bps));

        let inner = Arc::new(EngineInner {
            config,
            database,
            limiter,
            pool: Arc::new(ConnectionPool::default()),
            cookies: Arc::new(CookieStore::new()),
            credentials: Arc::new(CredentialStore::new()),
            proxies: Arc::new(ProxyResolver::new()),
            events: EventBus::new(),
            active: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
        });

        let background = vec![
            tokio::spawn(speed_aggregator(Arc::clone(&inner))),
            tokio::spawn(state_snapshotter(Arc::clone(&inner))),
        ];

        info!("download engine started");

        Ok(Self {
            inner,
            background: Arc::new(Mutex::new(background)),
        })
    }

    /// Registers an entry in the catalog and returns its ID. The
    /// download stays Queued until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidUrl`] for unsupported schemes and
    /// [`EngineError::Db`] when the catalog write fails.
    #[instrument(skip(self, request), fields(url = %request.url))]
    pub fn add(&self, request: AddRequest) -> Result<String, EngineError> {
        if Scheme::of(&request.url).is_err() {
            return Err(EngineError::InvalidUrl { url: request.url });
        }

        let config = &self.inner.config;
        let mut entry = DownloadEntry::new(&request.url);

        if let Some(name) = request.file_name {
            entry.file_name = filename::sanitize_filename(&name);
        } else if let Some(name) = filename::filename_from_url(&request.url) {
            entry.file_name = name;
        }
        entry.category = filename::categorize_filename(&entry.file_name).to_string();
        entry.save_path = request
            .save_dir
            .unwrap_or_else(|| config.default_save_dir.clone());
        entry.referrer = request.referrer.unwrap_or_default();
        entry.cookies = request.cookies.unwrap_or_default();
        entry.num_connections = EngineConfig::clamp_connections(
            request.num_connections.unwrap_or(config.default_max_connections),
        );
        entry.max_retries = config.default_retry_count;
        entry.user_agent = config.user_agent.clone();
        if let Some((checksum, algorithm)) = request.checksum {
            entry.checksum = checksum;
            entry.checksum_type = algorithm;
        }
        entry.description = request.description.unwrap_or_default();

        let id = self.inner.database.add(&mut entry)?;
        self.inner.events.emit(EngineEvent::Added { id: id.clone() });

        debug!(id, "download added");
        Ok(id)
    }

    /// Convenience wrapper for [`add`](Self::add) with a bare URL.
    ///
    /// # Errors
    ///
    /// As for [`add`](Self::add).
    pub fn add_url(&self, url: &str) -> Result<String, EngineError> {
        self.add(AddRequest::new(url))
    }

    /// Starts (or restarts) a download. Returns immediately; the work
    /// proceeds in a background orchestrator task.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyActive`] when the download is
    /// running and [`EngineError::NotFound`] for unknown IDs.
    #[instrument(skip(self))]
    pub fn start(&self, id: &str) -> Result<(), EngineError> {
        if self.inner.lookup(id).is_some() {
            return Err(EngineError::AlreadyActive { id: id.to_string() });
        }

        let mut entry = self
            .inner
            .database
            .get(id)
            .ok_or_else(|| EngineError::NotFound { id: id.to_string() })?;

        let resuming = entry.status == DownloadStatus::Paused;
        entry.status = DownloadStatus::Connecting;
        self.inner.database.update(&entry)?;

        let active = Arc::new(ActiveDownload::new(entry));
        self.inner.register(Arc::clone(&active));

        // Events go out before the orchestrator task can race ahead to
        // its own notifications, keeping the per-ID causal order.
        if resuming {
            self.inner
                .events
                .emit(EngineEvent::Resumed { id: id.to_string() });
        }
        self.inner
            .events
            .emit(EngineEvent::Started { id: id.to_string() });

        tokio::spawn(orchestrator::run_download(
            Arc::clone(&self.inner),
            active,
        ));
        Ok(())
    }

    /// Pauses a download. In-flight requests abort promptly; progress
    /// is snapshotted for resume.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when the ID is neither active
    /// nor in the catalog.
    #[instrument(skip(self))]
    pub fn pause(&self, id: &str) -> Result<(), EngineError> {
        if let Some(active) = self.inner.lookup(id) {
            active.pause();
            return Ok(());
        }

        // Not running: mark the catalog entry directly.
        let mut entry = self
            .inner
            .database
            .get(id)
            .ok_or_else(|| EngineError::NotFound { id: id.to_string() })?;
        entry.status = DownloadStatus::Paused;
        self.inner.database.update(&entry)?;
        self.inner
            .events
            .emit(EngineEvent::Paused { id: id.to_string() });
        Ok(())
    }

    /// Stops a running download (ends in Paused, resumable later).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] when the download is not
    /// running.
    pub fn stop(&self, id: &str) -> Result<(), EngineError> {
        let active = self
            .inner
            .lookup(id)
            .ok_or_else(|| EngineError::NotFound { id: id.to_string() })?;
        active.cancel();
        active.pause();
        Ok(())
    }

    /// Starts every entry that is not complete and not running.
    pub fn start_all(&self) {
        for entry in self.inner.database.list() {
            if entry.status == DownloadStatus::Complete {
                continue;
            }
            if let Err(error) = self.start(&entry.id) {
                debug!(id = %entry.id, %error, "skipping start_all entry");
            }
        }
    }

    /// Stops every running download.
    pub fn stop_all(&self) {
        for active in self.inner.active_list() {
            active.pause();
        }
    }

    /// Restarts every paused entry.
    pub fn resume_all(&self) {
        for entry in self.inner.database.list_by_status(DownloadStatus::Paused) {
            if let Err(error) = self.start(&entry.id) {
                debug!(id = %entry.id, %error, "skipping resume_all entry");
            }
        }
    }

    /// Stops a download if running, waits for it to drain, and removes
    /// its entry, optionally deleting on-disk files.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotFound`] for unknown IDs.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: &str, delete_files: bool) -> Result<(), EngineError> {
        if let Some(active) = self.inner.lookup(id) {
            active.cancel();
            let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
            while self.inner.lookup(id).is_some() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(DRAIN_POLL).await;
            }
            drop(active);
        }

        self.inner.database.remove(id, delete_files)?;
        let _ = self.inner.database.flush();
        self.inner
            .events
            .emit(EngineEvent::Removed { id: id.to_string() });
        Ok(())
    }

    /// Probes a URL without adding it: response metadata, the filename
    /// the engine would choose, and its category.
    ///
    /// # Errors
    ///
    /// Returns the transport error, or [`DownloadError::HttpStatus`]
    /// for probe responses of 400 and above.
    #[instrument(skip(self))]
    pub async fn probe(&self, url: &str) -> Result<Probe, DownloadError> {
        let scheme = Scheme::of(url)?;

        let entry = DownloadEntry::new(url);
        let config = orchestrator::request_config_for(&self.inner, &entry, url);

        let info = match scheme {
            Scheme::Http => {
                let client = self.inner.pool.acquire_http();
                let result = Transport::probe(client.as_ref(), &config).await;
                self.inner.pool.release_http(client);
                result?
            }
            Scheme::Ftp => {
                let client = self.inner.pool.acquire_ftp();
                let result = Transport::probe(client.as_ref(), &config).await;
                self.inner.pool.release_ftp(client);
                result?
            }
        };

        if info.status >= 400 {
            return Err(DownloadError::http_status(url, info.status));
        }

        let suggested_name = info
            .disposition_filename
            .as_deref()
            .map(filename::sanitize_filename)
            .filter(|name| !name.is_empty())
            .or_else(|| filename::filename_from_url(&info.final_url))
            .unwrap_or_else(|| "download".to_string());
        let category = filename::categorize_filename(&suggested_name).to_string();

        Ok(Probe {
            info,
            suggested_name,
            category,
        })
    }

    /// Returns the freshest view of an entry: the in-flight working
    /// copy when the download is active, else the catalog record.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<DownloadEntry> {
        if let Some(active) = self.inner.lookup(id) {
            return Some(active.entry_snapshot());
        }
        self.inner.database.get(id)
    }

    /// Lists all entries.
    #[must_use]
    pub fn list(&self) -> Vec<DownloadEntry> {
        self.inner.database.list()
    }

    /// Lists entries in a status.
    #[must_use]
    pub fn list_by_status(&self, status: DownloadStatus) -> Vec<DownloadEntry> {
        self.inner.database.list_by_status(status)
    }

    /// Number of downloads currently running.
    #[must_use]
    pub fn active_count(&self) -> usize {
        lock(&self.inner.active).len()
    }

    /// Aggregate speed across all active downloads, bytes/sec.
    #[must_use]
    pub fn total_speed(&self) -> f64 {
        self.inner.limiter.current_total_speed()
    }

    /// Subscribes to the engine event stream.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// The cookie store consulted for request decoration.
    #[must_use]
    pub fn cookies(&self) -> &CookieStore {
        &self.inner.cookies
    }

    /// The credential store consulted for request decoration.
    #[must_use]
    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.credentials
    }

    /// The proxy resolver consulted for request decoration.
    #[must_use]
    pub fn proxies(&self) -> &ProxyResolver {
        &self.inner.proxies
    }

    /// Reconfigures the global rate cap (0 = unlimited).
    pub fn set_rate_limit(&self, bytes_per_sec: u64) {
        self.inner.limiter.set_limit(bytes_per_sec);
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Stops everything, waits for orchestrators to drain, ends the
    /// background tasks, and flushes the catalog.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        self.inner.running.store(false, Ordering::SeqCst);

        for active in self.inner.active_list() {
            active.pause();
        }

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while self.active_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        if self.active_count() > 0 {
            warn!(count = self.active_count(), "downloads did not drain in time");
        }

        for handle in lock(&self.background).drain(..) {
            handle.abort();
        }

        self.inner.pool.clear();
        let _ = self.inner.database.flush();
        info!("engine shutdown complete");
    }
}

/// Background task: samples per-download speed every
/// `speed_sample_interval_ms`, publishes progress and segment events,
/// updates the catalog fast path, and maintains the aggregate speed.
async fn speed_aggregator(inner: Arc<EngineInner>) {
    let interval = Duration::from_millis(inner.config.speed_sample_interval_ms);

    while inner.running.load(Ordering::SeqCst) {
        tokio::time::sleep(interval).await;

        let mut total_speed = 0.0;
        let actives = inner.active_list();
        let active_count = actives.len();

        for active in actives {
            let Some(segments) = active.segments() else {
                continue; // still probing
            };

            let speed = segments.total_speed();
            let downloaded = segments.total_downloaded();
            let infos = segments.to_segment_infos();
            let total = active.with_entry(|e| {
                e.downloaded_bytes = downloaded;
                e.record_speed(speed);
                e.segments.clone_from(&infos);
                e.file_size
            });
            total_speed += speed;

            let _ = inner
                .database
                .update_progress(active.id(), downloaded, speed, infos);

            inner.events.emit(EngineEvent::Progress {
                id: active.id().to_string(),
                downloaded,
                total,
                speed,
            });
            inner.events.emit(EngineEvent::SegmentMapChanged {
                id: active.id().to_string(),
                segments: segments.segments(),
            });
        }

        inner.limiter.update_total_speed(total_speed);
        inner.events.emit(EngineEvent::SpeedUpdate {
            total_speed,
            active: active_count,
        });
    }
}

/// Background task: persists segment snapshots and flushes the catalog
/// every `segment_save_interval_ms`.
async fn state_snapshotter(inner: Arc<EngineInner>) {
    let interval = Duration::from_millis(inner.config.segment_save_interval_ms);

    while inner.running.load(Ordering::SeqCst) {
        tokio::time::sleep(interval).await;

        for active in inner.active_list() {
            if active.is_cancelled() {
                continue;
            }
            let Some(segments) = active.segments() else {
                continue;
            };
            if segments.is_complete() {
                // Finalize owns (and deletes) the snapshot from here.
                continue;
            }

            let entry = active.entry_snapshot();
            if let Err(error) = crate::download::resume::save_state(&entry, &segments.to_records())
            {
                warn!(id = %entry.id, %error, "periodic snapshot failed");
            }
        }

        if let Err(error) = inner.database.flush() {
            warn!(%error, "periodic database flush failed");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_engine(dir: &TempDir) -> DownloadEngine {
        let config = EngineConfig {
            data_dir: dir.path().join("data"),
            default_save_dir: dir.path().join("downloads"),
            ..EngineConfig::default()
        };
        DownloadEngine::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_add_assigns_id_and_defaults() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);

        let id = engine
            .add(AddRequest::new("https://example.com/files/movie.mkv"))
            .unwrap();

        let entry = engine.get(&id).unwrap();
        assert_eq!(entry.file_name, "movie.mkv");
        assert_eq!(entry.category, "Video");
        assert_eq!(entry.status, DownloadStatus::Queued);
        assert_eq!(entry.num_connections, 8);
        assert_eq!(entry.save_path, dir.path().join("downloads"));
    }

    #[tokio::test]
    async fn test_add_rejects_unsupported_scheme() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);

        let result = engine.add(AddRequest::new("magnet:?xt=urn:btih:abc"));
        assert!(matches!(result, Err(EngineError::InvalidUrl { .. })));
    }

    #[tokio::test]
    async fn test_add_clamps_connection_count() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);

        let id = engine
            .add(AddRequest {
                num_connections: Some(99),
                ..AddRequest::new("https://example.com/a.bin")
            })
            .unwrap();
        assert_eq!(engine.get(&id).unwrap().num_connections, 32);
    }

    #[tokio::test]
    async fn test_add_emits_event() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        let mut events = engine.subscribe();

        let id = engine.add_url("https://example.com/a.bin").unwrap();
        match events.recv().await.unwrap() {
            EngineEvent::Added { id: event_id } => assert_eq!(event_id, id),
            other => panic!("expected Added, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_unknown_id() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        assert!(matches!(
            engine.start("no-such-id"),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_pause_inactive_marks_catalog() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);

        let id = engine.add_url("https://example.com/a.bin").unwrap();
        engine.pause(&id).unwrap();
        assert_eq!(engine.get(&id).unwrap().status, DownloadStatus::Paused);
    }

    #[tokio::test]
    async fn test_remove_unknown_id() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);
        let result = engine.remove("no-such-id", false).await;
        assert!(matches!(result, Err(EngineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_list_by_status() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);

        engine.add_url("https://example.com/a.bin").unwrap();
        engine.add_url("https://example.com/b.bin").unwrap();

        assert_eq!(engine.list().len(), 2);
        assert_eq!(engine.list_by_status(DownloadStatus::Queued).len(), 2);
        assert_eq!(engine.list_by_status(DownloadStatus::Complete).len(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_catalog() {
        let dir = TempDir::new().unwrap();
        let engine = test_engine(&dir);

        let id = engine.add_url("https://example.com/a.bin").unwrap();
        engine.shutdown().await;

        // A fresh engine over the same data dir sees the entry.
        let config = EngineConfig {
            data_dir: dir.path().join("data"),
            default_save_dir: dir.path().join("downloads"),
            ..EngineConfig::default()
        };
        let reopened = DownloadEngine::new(config).unwrap();
        assert!(reopened.get(&id).is_some());
    }
}
