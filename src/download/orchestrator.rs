//! Per-download lifecycle coordination.
//!
//! One orchestrator task runs per active download. It owns the
//! download's scoped resources - probe result, segment map, partial
//! file handle, and worker task handles - and releases them in reverse
//! order on every exit path: normal completion, pause, error, or
//! cancellation.
//!
//! Lifecycle: probe, plan the connection count, resume from a validated
//! snapshot or initialize a fresh map, open the partial file, dispatch
//! workers, await their drain, then finalize / persist / surface an
//! error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::SystemTime;

use tracing::{debug, info, instrument, warn};

use crate::db::{DownloadEntry, DownloadStatus};

use super::assembler::{self, ConflictPolicy, PartialFile};
use super::checksum::{self, HashAlgorithm};
use super::client::RequestConfig;
use super::engine::EngineInner;
use super::error::DownloadError;
use super::event::EngineEvent;
use super::resume;
use super::retry::RetryPolicy;
use super::segment::SegmentManager;
use super::session::Credential;
use super::transport::{Scheme, Transport};
use super::worker::{run_worker, WorkerEnv};
use super::filename;

/// Shared state of one in-flight download.
///
/// The orchestrator owns the lifecycle; workers and the engine's
/// background tasks observe it through this handle.
#[derive(Debug)]
pub(crate) struct ActiveDownload {
    id: String,
    entry: Mutex<DownloadEntry>,
    segments: OnceLock<Arc<SegmentManager>>,
    cancelled: AtomicBool,
    paused: AtomicBool,
    permanent_failure: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl ActiveDownload {
    pub(crate) fn new(entry: DownloadEntry) -> Self {
        Self {
            id: entry.id.clone(),
            entry: Mutex::new(entry),
            segments: OnceLock::new(),
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            permanent_failure: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// Requests a cooperative stop; in-flight chunk callbacks abort.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Requests a pause: both flags are set so open connections abort
    /// promptly; resuming later starts a fresh worker generation.
    pub(crate) fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn flag_permanent_failure(&self) {
        self.permanent_failure.store(true, Ordering::SeqCst);
    }

    pub(crate) fn had_permanent_failure(&self) -> bool {
        self.permanent_failure.load(Ordering::SeqCst)
    }

    pub(crate) fn record_failure(&self, message: String) {
        *lock(&self.failure) = Some(message);
    }

    fn take_failure(&self) -> Option<String> {
        lock(&self.failure).clone()
    }

    /// The segment map, once the orchestrator has initialized it.
    pub(crate) fn segments(&self) -> Option<Arc<SegmentManager>> {
        self.segments.get().cloned()
    }

    /// Runs a closure against the working entry.
    pub(crate) fn with_entry<R>(&self, f: impl FnOnce(&mut DownloadEntry) -> R) -> R {
        f(&mut lock(&self.entry))
    }

    /// Clones the working entry.
    pub(crate) fn entry_snapshot(&self) -> DownloadEntry {
        lock(&self.entry).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Builds the decorated request configuration for an entry.
///
/// Entry-level decoration wins; the session stores fill anything the
/// entry does not carry.
pub(crate) fn request_config_for(
    inner: &EngineInner,
    entry: &DownloadEntry,
    url: &str,
) -> RequestConfig {
    let config = &inner.config;

    let user_agent = if entry.user_agent.is_empty() {
        config.user_agent.clone()
    } else {
        entry.user_agent.clone()
    };

    let cookies = if entry.cookies.is_empty() {
        inner.cookies.cookies_for_url(url)
    } else {
        entry.cookies.clone()
    };

    let credential = if entry.username.is_empty() {
        inner.credentials.find(url)
    } else {
        Some(Credential {
            username: entry.username.clone(),
            password: entry.password.clone(),
        })
    };
    let (username, password) = credential
        .map(|c| (c.username, c.password))
        .unwrap_or_default();

    RequestConfig {
        referrer: entry.referrer.clone(),
        user_agent,
        cookies,
        post_data: entry.post_data.clone(),
        username,
        password,
        proxy: inner.proxies.proxy_for_url(url),
        max_redirects: config.max_redirects,
        connect_timeout: std::time::Duration::from_secs(config.default_timeout_secs),
        receive_timeout: std::time::Duration::from_secs(config.receive_timeout_secs),
        verify_tls: config.verify_tls,
        ..RequestConfig::new(url)
    }
}

/// Checks out the right protocol client for a URL.
///
/// The returned closure gives the client back to the pool.
fn checkout_transport(
    inner: &Arc<EngineInner>,
    scheme: Scheme,
) -> (Arc<dyn Transport>, Box<dyn FnOnce() + Send>) {
    match scheme {
        Scheme::Http => {
            let client = inner.pool.acquire_http();
            let transport: Arc<dyn Transport> = client.clone();
            let pool = Arc::clone(&inner.pool);
            (transport, Box::new(move || pool.release_http(client)))
        }
        Scheme::Ftp => {
            let client = inner.pool.acquire_ftp();
            let transport: Arc<dyn Transport> = client.clone();
            let pool = Arc::clone(&inner.pool);
            (transport, Box::new(move || pool.release_ftp(client)))
        }
    }
}

/// Runs the full lifecycle of one download to a terminal state.
#[instrument(skip(inner, active), fields(id = %active.id()))]
pub(crate) async fn run_download(inner: Arc<EngineInner>, active: Arc<ActiveDownload>) {
    let id = active.id().to_string();

    let url = active.with_entry(|e| e.url.clone());
    let scheme = match Scheme::of(&url) {
        Ok(scheme) => scheme,
        Err(error) => {
            fail(&inner, &active, error.to_string());
            inner.deregister(&id);
            return;
        }
    };

    let (transport, release) = checkout_transport(&inner, scheme);

    let outcome = run_phases(&inner, &active, transport).await;

    release();

    match outcome {
        Outcome::Complete | Outcome::Paused => {}
        Outcome::Failed(message) => fail(&inner, &active, message),
    }

    inner.deregister(&id);
    let _ = inner.database.flush();
}

/// Terminal disposition of one orchestrator run.
enum Outcome {
    Complete,
    Paused,
    Failed(String),
}

#[allow(clippy::too_many_lines)]
async fn run_phases(
    inner: &Arc<EngineInner>,
    active: &Arc<ActiveDownload>,
    transport: Arc<dyn Transport>,
) -> Outcome {
    let id = active.id().to_string();
    let config = &inner.config;

    // Phase 1: probe.
    let url = active.with_entry(|e| e.url.clone());
    let probe_config = active.with_entry(|e| request_config_for(inner, e, &url));

    let probe = match transport.probe(&probe_config).await {
        Ok(probe) => probe,
        Err(error) => return Outcome::Failed(error.to_string()),
    };
    if probe.status >= 400 {
        return Outcome::Failed(format!("HTTP {} probing {url}", probe.status));
    }

    // The validators cached from the previous session are what resume
    // validation compares against; snapshot them before the probe
    // result overwrites the entry.
    let mut cached = active.entry_snapshot();

    // Record server metadata on the entry.
    active.with_entry(|entry| {
        entry.final_url = probe.final_url.clone();
        if probe.content_length > 0 {
            entry.file_size = probe.content_length;
        }
        entry.resume_supported = probe.accept_ranges;
        entry.etag = probe.etag.clone();
        entry.last_modified = probe.last_modified.clone();
        entry.content_type = probe.content_type.clone();

        if entry.file_name.is_empty() {
            entry.file_name = probe
                .disposition_filename
                .as_deref()
                .map(filename::sanitize_filename)
                .filter(|name| !name.is_empty())
                .or_else(|| filename::filename_from_url(&entry.final_url))
                .unwrap_or_else(|| "download".to_string());
        }
        if entry.category.is_empty() {
            entry.category = filename::categorize_filename(&entry.file_name).to_string();
        }
        if entry.save_path.as_os_str().is_empty() {
            entry.save_path.clone_from(&config.default_save_dir);
        }
    });

    // Phase 2: plan the connection count.
    let (file_size, resume_supported, requested) =
        active.with_entry(|e| (e.file_size, e.resume_supported, e.num_connections));
    let planned = if resume_supported && file_size > 0 {
        crate::config::EngineConfig::clamp_connections(requested) as usize
    } else {
        1
    };

    // Phase 3: resume from a validated snapshot, or start fresh. A
    // snapshot only counts when the entry actually has prior progress;
    // a stray state file under a fresh entry is unaccountable.
    let entry_snapshot = active.entry_snapshot();
    let prior_progress = cached.downloaded_bytes > 0;
    let loaded = if prior_progress {
        resume::load_state(&entry_snapshot)
    } else {
        None
    };
    let segments = if let Some((snap_size, records)) = loaded {
        let validated =
            resume::validate(&mut cached, &probe) && snap_size == cached.file_size;
        if validated {
            info!(segments = records.len(), "resuming from snapshot");
            Arc::new(SegmentManager::restore(
                &records,
                snap_size,
                planned,
                config.min_segment_size,
            ))
        } else {
            // The server-side resource changed: recovered locally by
            // starting over, not surfaced as an error.
            warn!("snapshot invalid or server changed, restarting from zero");
            resume::cleanup(&entry_snapshot);
            Arc::new(SegmentManager::new(
                file_size,
                planned,
                config.min_segment_size,
            ))
        }
    } else {
        if resume::has_partial(&entry_snapshot) {
            // A partial without a snapshot is unaccountable.
            resume::cleanup(&entry_snapshot);
        }
        Arc::new(SegmentManager::new(
            file_size,
            planned,
            config.min_segment_size,
        ))
    };
    active.with_entry(|e| {
        e.downloaded_bytes = segments.total_downloaded();
        e.status = DownloadStatus::Downloading;
        e.error_message.clear();
    });
    let _ = inner.database.update(&active.entry_snapshot());
    let _ = active.segments.set(Arc::clone(&segments));

    // Phase 4: open the partial file.
    let (partial_path, final_url) =
        active.with_entry(|e| (e.partial_path(), e.final_url.clone()));
    let partial = match PartialFile::open(&partial_path, active.with_entry(|e| e.file_size)).await
    {
        Ok(partial) => partial,
        Err(error) => return Outcome::Failed(error.to_string()),
    };

    // Phase 5: dispatch workers.
    let fetch_url = if final_url.is_empty() { url } else { final_url };
    let template = active.with_entry(|e| request_config_for(inner, e, &fetch_url));
    let retry_policy = active.with_entry(|e| {
        RetryPolicy::new(
            e.max_retries,
            std::time::Duration::from_secs(config.retry_base_delay_secs),
        )
    });

    info!(connections = planned, file_size, "dispatching workers");

    let mut handles = Vec::with_capacity(planned);
    for worker_id in 0..planned {
        let env = WorkerEnv {
            worker_id,
            active: Arc::clone(active),
            segments: Arc::clone(&segments),
            partial: partial.clone(),
            transport: Arc::clone(&transport),
            limiter: Arc::clone(&inner.limiter),
            template: template.clone(),
            retry_policy: retry_policy.clone(),
            buffer_size: config.buffer_size,
        };
        handles.push(tokio::spawn(run_worker(env)));
    }

    // Phase 6: await the drain.
    for handle in handles {
        if let Err(error) = handle.await {
            warn!(%error, "worker task panicked");
        }
    }

    if let Err(error) = partial.sync().await {
        return Outcome::Failed(error.to_string());
    }
    drop(partial);

    // Phase 7: terminate.
    let complete = segments.is_complete();

    if active.is_cancelled() && !complete {
        let snapshot = persist_progress(inner, active, &segments);
        active.with_entry(|e| e.status = DownloadStatus::Paused);
        let _ = inner.database.update(&active.entry_snapshot());
        if let Err(error) = snapshot {
            warn!(%error, "failed to save segment snapshot on pause");
        }
        info!("download paused");
        inner.events.emit(EngineEvent::Paused { id });
        return Outcome::Paused;
    }

    if complete {
        return finalize_download(inner, active, &segments).await;
    }

    // Workers drained without completing: surface the recorded cause.
    let snapshot = persist_progress(inner, active, &segments);
    if let Err(error) = snapshot {
        warn!(%error, "failed to save segment snapshot on error");
    }
    let message = active
        .take_failure()
        .unwrap_or_else(|| "download incomplete".to_string());
    warn!(
        permanent = active.had_permanent_failure(),
        downloaded = segments.total_downloaded(),
        "workers drained without completing"
    );
    Outcome::Failed(message)
}

/// Saves the segment snapshot and syncs downloaded-byte accounting.
fn persist_progress(
    inner: &Arc<EngineInner>,
    active: &Arc<ActiveDownload>,
    segments: &Arc<SegmentManager>,
) -> Result<(), DownloadError> {
    active.with_entry(|e| {
        e.downloaded_bytes = segments.total_downloaded();
        e.segments = segments.to_segment_infos();
    });
    let entry = active.entry_snapshot();
    let _ = inner
        .database
        .update_progress(&entry.id, entry.downloaded_bytes, 0.0, entry.segments.clone());
    resume::save_state(&entry, &segments.to_records())
}

/// Merging phase: rename, stamp, verify, clean up.
async fn finalize_download(
    inner: &Arc<EngineInner>,
    active: &Arc<ActiveDownload>,
    segments: &Arc<SegmentManager>,
) -> Outcome {
    let id = active.id().to_string();

    active.with_entry(|e| {
        // A size-less transfer learns its size at EOF.
        if e.file_size <= 0 {
            e.file_size = segments.file_size();
        }
        e.downloaded_bytes = segments.total_downloaded();
        e.status = DownloadStatus::Merging;
    });
    let _ = inner.database.update(&active.entry_snapshot());

    let entry = active.entry_snapshot();
    let realized = match assembler::finalize(
        &entry.partial_path(),
        &entry.full_path(),
        ConflictPolicy::AutoRename,
    )
    .await
    {
        Ok(path) => path,
        Err(error) => return Outcome::Failed(format!("finalize failed: {error}")),
    };

    assembler::set_timestamp(&realized, &entry.last_modified);

    // Integrity check is advisory: a mismatch completes with a warning.
    let mut warning = None;
    if !entry.checksum.is_empty() {
        match HashAlgorithm::parse(&entry.checksum_type) {
            Some(algorithm) => {
                match checksum::verify_file(&realized, &entry.checksum, algorithm).await {
                    Ok(true) => debug!("checksum verified"),
                    Ok(false) => {
                        warn!(expected = %entry.checksum, "checksum mismatch");
                        warning = Some("checksum mismatch".to_string());
                    }
                    Err(error) => {
                        warn!(%error, "checksum verification failed to run");
                        warning = Some(format!("checksum unverified: {error}"));
                    }
                }
            }
            None => {
                warn!(tag = %entry.checksum_type, "unknown checksum algorithm");
                warning = Some(format!("unknown checksum algorithm {}", entry.checksum_type));
            }
        }
    }

    // The realized name can differ from the target under auto-rename.
    let realized_name = realized
        .file_name()
        .map(|n| n.to_string_lossy().into_owned());

    active.with_entry(|e| {
        if let Some(name) = realized_name {
            e.file_name = name;
        }
        e.status = DownloadStatus::Complete;
        e.date_completed = Some(SystemTime::now());
        e.downloaded_bytes = e.file_size.max(0);
        e.current_speed = 0.0;
        e.error_message = warning.clone().unwrap_or_default();
        e.segments = segments.to_segment_infos();
    });

    // Snapshot is obsolete once the rename has landed.
    let _ = std::fs::remove_file(entry.segment_path());

    let _ = inner.database.update(&active.entry_snapshot());
    let _ = inner.database.flush();

    info!(path = %realized.display(), "download complete");
    inner.events.emit(EngineEvent::Complete { id });
    Outcome::Complete
}

/// Error path shared by every phase: record, persist, publish.
fn fail(inner: &Arc<EngineInner>, active: &Arc<ActiveDownload>, message: String) {
    warn!(id = %active.id(), %message, "download failed");

    active.with_entry(|e| {
        e.status = DownloadStatus::Error;
        e.error_message.clone_from(&message);
        e.current_speed = 0.0;
    });
    let _ = inner.database.update(&active.entry_snapshot());

    inner.events.emit(EngineEvent::Error {
        id: active.id().to_string(),
        message,
    });
}
