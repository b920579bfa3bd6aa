//! Download orchestration.
//!
//! [`DownloadEngine`] accepts `(url, filename)` submissions, assigns ids,
//! resolves credentials, writes the `PENDING` record and starts the transfer
//! on the configured backend. Every later change to a record (progress,
//! terminal state, reconciliation results) is applied under a single write
//! gate, so the record store only ever sees one writer at a time.
//!
//! Transfer failures never surface from [`DownloadEngine::submit`]; they end
//! up in the record and on the event stream.
//!
//! # Example
//!
//! ```no_run
//! use netdisk_core::{DownloadEngine, EngineConfig};
//! use netdisk_core::engine::EngineEvent;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = DownloadEngine::builder(EngineConfig::default()).build().await?;
//! let mut events = engine.subscribe();
//! let id = engine.submit("https://pan.example.com/file/report.pdf", "report.pdf").await?;
//! while let Ok(event) = events.recv().await {
//!     if let EngineEvent::Finished { download_id, success, .. } = event {
//!         if download_id == id {
//!             println!("finished: {success}");
//!             break;
//!         }
//!     }
//! }
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod events;
mod ids;
mod poller;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use events::{EngineEvent, media_type_for};

use self::events::EventBus;
use self::ids::IdGenerator;
use crate::auth::{Authenticator, Credential};
use crate::config::{EngineConfig, TransferMode};
use crate::external::{BackgroundDownloadService, ExternalAdapter, ExternalSubsystem};
use crate::lifecycle::{TransferPath, resolve_transition};
use crate::store::{DownloadRecord, DownloadStatus, MemoryBackend, RecordStore, StoreError};
use crate::transfer::{
    ProgressSample, TransferError, TransferExecutor, TransferOutcome, filename_from_url,
    sanitize_filename, unique_destination,
};

/// Failure reason for transfers cut short by shutdown or a process exit.
pub const INTERRUPTED: &str = "interrupted";

/// Errors returned by engine operations.
///
/// Transfer outcomes are not errors of the engine API; see the module docs.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine has been shut down and accepts no new work.
    #[error("download engine is shutting down")]
    ShuttingDown,

    /// The download directory could not be resolved.
    #[error("invalid download directory {path}: {source}")]
    DownloadDir {
        /// Configured directory.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The saved history could not be read, so ids cannot be allocated
    /// safely.
    #[error("download history is unavailable: {0}")]
    History(#[from] StoreError),

    /// The HTTP client could not be built.
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Backend chosen once at construction.
#[derive(Debug)]
enum TransferStrategy {
    Streamed(TransferExecutor),
    Delegated(ExternalAdapter),
}

impl TransferStrategy {
    fn path(&self) -> TransferPath {
        match self {
            Self::Streamed(_) => TransferPath::Streamed,
            Self::Delegated(_) => TransferPath::Delegated,
        }
    }
}

#[derive(Debug)]
enum TransferHandle {
    Streamed {
        cancel: CancellationToken,
        /// Taken by `shutdown` while it waits for the task.
        task: Option<JoinHandle<()>>,
    },
    /// `external_id` is `None` while the hand-off is still in progress.
    Delegated { external_id: Option<i64> },
}

/// In-memory state of a transfer that has not reached a terminal state.
///
/// `record` is the authoritative copy while the transfer runs, so a store
/// that rejects writes does not stall progress.
#[derive(Debug)]
struct ActiveTransfer {
    record: DownloadRecord,
    handle: TransferHandle,
}

impl ActiveTransfer {
    fn polled_handle(&self) -> Option<i64> {
        match self.handle {
            TransferHandle::Delegated { external_id } => external_id,
            TransferHandle::Streamed { .. } => None,
        }
    }
}

#[derive(Debug)]
struct EngineInner {
    config: EngineConfig,
    store: RecordStore,
    auth: Authenticator,
    strategy: TransferStrategy,
    ids: IdGenerator,
    events: EventBus,
    /// Lock order: `gate`, then `active`.
    gate: Mutex<()>,
    active: Mutex<HashMap<u64, ActiveTransfer>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// Handle to the download engine. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct DownloadEngine {
    inner: Arc<EngineInner>,
}

/// Configures and builds a [`DownloadEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<RecordStore>,
    auth: Option<Authenticator>,
    executor: Option<TransferExecutor>,
    external: Option<Arc<dyn ExternalSubsystem>>,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    /// Record store to use; defaults to an in-memory store.
    #[must_use]
    pub fn store(mut self, store: RecordStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Credential source; defaults to an empty jar.
    #[must_use]
    pub fn authenticator(mut self, auth: Authenticator) -> Self {
        self.auth = Some(auth);
        self
    }

    /// HTTP executor; defaults to one built from the configured timeouts.
    #[must_use]
    pub fn executor(mut self, executor: TransferExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// External subsystem for delegated mode; defaults to a
    /// [`BackgroundDownloadService`]. Ignored in streamed mode.
    #[must_use]
    pub fn external(mut self, subsystem: Arc<dyn ExternalSubsystem>) -> Self {
        self.external = Some(subsystem);
        self
    }

    /// Builds the engine and recovers transfers left unfinished by a
    /// previous process.
    ///
    /// Streamed records found non-terminal are marked `FAILED` and their
    /// partial files removed. Delegated records that carry a handle are
    /// resumed by the reconciliation poller.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the download directory cannot be made
    /// absolute, the saved history cannot be read, or the HTTP client cannot
    /// be built.
    #[instrument(skip(self), fields(mode = %self.config.transfer_mode))]
    pub async fn build(self) -> Result<DownloadEngine, EngineError> {
        let mut config = self.config;
        config.download_dir =
            std::path::absolute(&config.download_dir).map_err(|source| EngineError::DownloadDir {
                path: config.download_dir.clone(),
                source,
            })?;

        let store = match self.store {
            Some(store) => store,
            None => RecordStore::open(Arc::new(MemoryBackend::new())).await,
        };
        let ids = IdGenerator::after(store.max_id().await?);
        let executor = match self.executor {
            Some(executor) => executor,
            None => TransferExecutor::new(config.connect_timeout, config.read_timeout)?,
        };
        let strategy = match config.transfer_mode {
            TransferMode::Streamed => TransferStrategy::Streamed(executor),
            TransferMode::Delegated => {
                let subsystem: Arc<dyn ExternalSubsystem> = match self.external {
                    Some(subsystem) => subsystem,
                    None => {
                        // A fresh service knows no handles from earlier runs;
                        // new ones must not collide with those still saved.
                        let saved = last_external_id(&store.list_all().await);
                        Arc::new(BackgroundDownloadService::new(executor).with_ids_after(saved))
                    }
                };
                TransferStrategy::Delegated(ExternalAdapter::new(subsystem))
            }
        };

        let inner = Arc::new(EngineInner {
            config,
            store,
            auth: self.auth.unwrap_or_default(),
            strategy,
            ids,
            events: EventBus::default(),
            gate: Mutex::new(()),
            active: Mutex::new(HashMap::new()),
            poller: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        if inner.recover_unfinished().await {
            inner.ensure_poller().await;
        }
        info!(download_dir = %inner.config.download_dir.display(), "download engine ready");
        Ok(DownloadEngine { inner })
    }
}

/// Highest subsystem handle recorded in `records`.
fn last_external_id(records: &[DownloadRecord]) -> Option<i64> {
    records.iter().filter_map(|record| record.external_id).max()
}

impl DownloadEngine {
    /// Starts configuring an engine.
    #[must_use]
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            store: None,
            auth: None,
            executor: None,
            external: None,
        }
    }

    /// Settings the engine runs with, with an absolute download directory.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The credential source shared with sign-in collaborators.
    #[must_use]
    pub fn authenticator(&self) -> &Authenticator {
        &self.inner.auth
    }

    /// Accepts a download and returns its id without waiting for the
    /// transfer.
    ///
    /// An empty `filename` is derived from the URL. When another in-flight
    /// transfer already targets the same destination, a `_2`, `_3`, ...
    /// suffix is added.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShuttingDown`] after [`shutdown`](Self::shutdown).
    #[instrument(skip(self), fields(url = %url))]
    pub async fn submit(&self, url: &str, filename: &str) -> Result<u64, EngineError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }

        let credential = inner.auth.header_for(url);
        let filename = if filename.trim().is_empty() {
            filename_from_url(url)
        } else {
            sanitize_filename(filename)
        };
        let id = inner.ids.next_id();

        let _gate = inner.gate.lock().await;
        let mut active = inner.active.lock().await;
        let taken: HashSet<PathBuf> = active
            .values()
            .map(|entry| entry.record.destination_path.clone())
            .collect();
        let destination = unique_destination(&inner.config.download_dir, &filename, &taken);
        let record = DownloadRecord::pending(id, filename.clone(), url, destination.clone());
        inner.persist(record.clone()).await;
        inner.events.publish(EngineEvent::Started {
            download_id: id,
            filename: filename.clone(),
        });

        let handle = match &inner.strategy {
            TransferStrategy::Streamed(executor) => {
                let cancel = inner.shutdown.child_token();
                let task = tokio::spawn(run_streamed(
                    Arc::clone(inner),
                    executor.clone(),
                    StreamedJob {
                        id,
                        url: url.to_string(),
                        destination,
                        credential,
                        cancel: cancel.clone(),
                    },
                ));
                TransferHandle::Streamed {
                    cancel,
                    task: Some(task),
                }
            }
            TransferStrategy::Delegated(adapter) => {
                tokio::spawn(run_delegation(
                    Arc::clone(inner),
                    adapter.clone(),
                    DelegationJob {
                        id,
                        url: url.to_string(),
                        filename,
                        destination,
                        credential,
                    },
                ));
                TransferHandle::Delegated { external_id: None }
            }
        };
        active.insert(id, ActiveTransfer { record, handle });
        info!(download_id = id, "download submitted");
        Ok(id)
    }

    /// Stops the transfer for `id`, if any, and deletes its record.
    ///
    /// Streamed transfers are interrupted and their partial file removed;
    /// delegated transfers get a cancellation request. The record is removed
    /// even if stopping the transfer fails. Returns whether anything existed
    /// for `id`.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: u64) -> bool {
        let inner = &self.inner;
        let entry = {
            let _gate = inner.gate.lock().await;
            inner.active.lock().await.remove(&id)
        };
        let was_active = entry.is_some();

        if let Some(entry) = entry {
            match entry.handle {
                TransferHandle::Streamed { cancel, task } => {
                    cancel.cancel();
                    if let Some(task) = task {
                        inner.await_task(id, task).await;
                    }
                }
                TransferHandle::Delegated { external_id } => {
                    if let (Some(external_id), TransferStrategy::Delegated(adapter)) =
                        (external_id, &inner.strategy)
                    {
                        if let Err(error) = adapter.cancel(external_id).await {
                            warn!(download_id = id, external_id, error = %error, "failed to cancel delegated transfer");
                        }
                    }
                }
            }
        }

        let _gate = inner.gate.lock().await;
        let existed = match inner.store.delete(id).await {
            Ok(existed) => existed,
            Err(error) => {
                warn!(download_id = id, error = %error, "failed to delete download record");
                false
            }
        };
        if was_active {
            inner.events.publish(EngineEvent::Finished {
                download_id: id,
                success: false,
                destination_path: None,
            });
        }
        debug!(download_id = id, was_active, existed, "download cancelled");
        was_active || existed
    }

    /// Deletes the record for `id`, cancelling its transfer first when one is
    /// still running. Downloaded files of finished records are kept.
    pub async fn remove(&self, id: u64) -> bool {
        let is_active = self.inner.active.lock().await.contains_key(&id);
        if is_active {
            return self.cancel(id).await;
        }
        let _gate = self.inner.gate.lock().await;
        match self.inner.store.delete(id).await {
            Ok(existed) => existed,
            Err(error) => {
                warn!(download_id = id, error = %error, "failed to delete download record");
                false
            }
        }
    }

    /// Current state of `id`. In-flight transfers report their live state.
    pub async fn get(&self, id: u64) -> Option<DownloadRecord> {
        if let Some(entry) = self.inner.active.lock().await.get(&id) {
            return Some(entry.record.clone());
        }
        self.inner.store.get(id).await
    }

    /// Every stored record, most recently updated first.
    pub async fn list_all(&self) -> Vec<DownloadRecord> {
        self.inner.store.list_all().await
    }

    /// Cancels every running transfer and empties the history.
    ///
    /// # Errors
    ///
    /// Returns the store error if the empty history cannot be written.
    pub async fn clear_history(&self) -> crate::store::Result<()> {
        let active_ids: Vec<u64> = self.inner.active.lock().await.keys().copied().collect();
        for id in active_ids {
            self.cancel(id).await;
        }
        let _gate = self.inner.gate.lock().await;
        self.inner.store.clear().await
    }

    /// Subscribes to presentation events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    /// Number of transfers not yet in a terminal state.
    pub async fn active_count(&self) -> usize {
        self.inner.active.lock().await.len()
    }

    /// Stops accepting work, interrupts streamed transfers and stops the
    /// poller. Interrupted streamed records end `FAILED`; delegated records
    /// stay as they are and are picked up again on the next start.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();

        let tasks: Vec<(u64, JoinHandle<()>)> = {
            let mut active = inner.active.lock().await;
            active
                .iter_mut()
                .filter_map(|(id, entry)| match &mut entry.handle {
                    TransferHandle::Streamed { task, .. } => task.take().map(|task| (*id, task)),
                    TransferHandle::Delegated { .. } => None,
                })
                .collect()
        };
        for (id, task) in tasks {
            inner.await_task(id, task).await;
        }

        let poller = inner.poller.lock().await.take();
        if let Some(poller) = poller {
            if let Err(error) = poller.await {
                warn!(error = %error, "reconciliation poller ended abnormally");
            }
        }
        info!("download engine stopped");
    }
}

impl EngineInner {
    async fn persist(&self, record: DownloadRecord) {
        let id = record.id;
        if let Err(error) = self.store.put(record).await {
            warn!(download_id = id, error = %error, "failed to persist download record; continuing in memory");
        }
    }

    async fn await_task(&self, id: u64, mut task: JoinHandle<()>) {
        match tokio::time::timeout(self.config.cancel_grace, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(download_id = id, error = %error, "transfer task ended abnormally"),
            Err(_) => {
                warn!(download_id = id, grace = ?self.config.cancel_grace, "transfer task did not stop in time; aborting");
                task.abort();
            }
        }
    }

    async fn apply_progress(&self, id: u64, sample: ProgressSample) {
        let _gate = self.gate.lock().await;
        let mut active = self.active.lock().await;
        let Some(entry) = active.get_mut(&id) else {
            return;
        };
        let record = &mut entry.record;
        record.status = resolve_transition(
            record.status,
            DownloadStatus::Downloading,
            TransferPath::Streamed,
        );
        record.progress_percent = record.progress_percent.max(sample.percent);
        record.bytes_downloaded = sample.bytes_downloaded;
        record.bytes_total = sample.bytes_total;
        let record = record.clone();
        drop(active);

        self.persist(record.clone()).await;
        self.events.publish(EngineEvent::Progress {
            download_id: id,
            percent: record.progress_percent,
            bytes_downloaded: record.bytes_downloaded,
            bytes_total: record.bytes_total,
        });
    }

    async fn finish_streamed(&self, id: u64, result: Result<TransferOutcome, TransferError>) {
        let _gate = self.gate.lock().await;
        let Some(entry) = self.active.lock().await.remove(&id) else {
            // Cancelled while finishing; a completed file is not wanted either.
            if let Ok(outcome) = result {
                remove_if_present(&outcome.path).await;
            }
            debug!(download_id = id, "transfer ended after cancellation");
            return;
        };

        let mut record = entry.record;
        match result {
            Ok(outcome) => {
                record.status = resolve_transition(
                    record.status,
                    DownloadStatus::Completed,
                    TransferPath::Streamed,
                );
                record.progress_percent = 100;
                record.bytes_downloaded = outcome.bytes_downloaded;
                record.bytes_total = outcome.bytes_total;
                record.failure_reason = None;
                info!(download_id = id, bytes = outcome.bytes_downloaded, "download completed");
                self.persist(record).await;
                self.events.publish(EngineEvent::Finished {
                    download_id: id,
                    success: true,
                    destination_path: Some(outcome.path),
                });
            }
            Err(error) => {
                let reason = if error.is_cancelled() && self.shutdown.is_cancelled() {
                    INTERRUPTED.to_string()
                } else {
                    error.diagnostic()
                };
                warn!(download_id = id, error = %error, "download failed");
                record.status =
                    resolve_transition(record.status, DownloadStatus::Failed, TransferPath::Streamed);
                record.failure_reason = Some(reason);
                self.persist(record).await;
                self.events.publish(EngineEvent::Finished {
                    download_id: id,
                    success: false,
                    destination_path: None,
                });
            }
        }
    }

    async fn fail_delegation(&self, id: u64, reason: String) {
        let _gate = self.gate.lock().await;
        let Some(entry) = self.active.lock().await.remove(&id) else {
            return;
        };
        let mut record = entry.record;
        record.status =
            resolve_transition(record.status, DownloadStatus::Failed, TransferPath::Delegated);
        record.failure_reason = Some(reason);
        self.persist(record).await;
        self.events.publish(EngineEvent::Finished {
            download_id: id,
            success: false,
            destination_path: None,
        });
    }

    /// Resolves records a previous process left non-terminal. Returns whether
    /// any delegated transfer was resumed.
    async fn recover_unfinished(&self) -> bool {
        let unfinished: Vec<DownloadRecord> = self
            .store
            .list_all()
            .await
            .into_iter()
            .filter(|record| !record.is_terminal())
            .collect();
        if unfinished.is_empty() {
            return false;
        }

        let _gate = self.gate.lock().await;
        let mut active = self.active.lock().await;
        let mut resumed = false;
        for mut record in unfinished {
            let id = record.id;
            match (self.strategy.path(), record.external_id) {
                (TransferPath::Delegated, Some(external_id)) => {
                    debug!(download_id = id, external_id, "resuming delegated transfer");
                    active.insert(
                        id,
                        ActiveTransfer {
                            record,
                            handle: TransferHandle::Delegated {
                                external_id: Some(external_id),
                            },
                        },
                    );
                    resumed = true;
                }
                _ => {
                    if !record.is_delegated() {
                        remove_if_present(&record.destination_path).await;
                    }
                    warn!(download_id = id, status = %record.status, "marking unfinished download as interrupted");
                    record.status = DownloadStatus::Failed;
                    record.failure_reason = Some(INTERRUPTED.to_string());
                    self.persist(record).await;
                }
            }
        }
        resumed
    }
}

async fn remove_if_present(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed leftover file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove leftover file"),
    }
}

struct StreamedJob {
    id: u64,
    url: String,
    destination: PathBuf,
    credential: Credential,
    cancel: CancellationToken,
}

async fn run_streamed(inner: Arc<EngineInner>, executor: TransferExecutor, job: StreamedJob) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let transfer = async {
        let result = executor
            .execute(
                job.id,
                &job.url,
                &job.destination,
                &job.credential,
                &tx,
                &job.cancel,
            )
            .await;
        drop(tx);
        result
    };
    let progress = async {
        while let Some(sample) = rx.recv().await {
            inner.apply_progress(job.id, sample).await;
        }
    };
    let (result, ()) = tokio::join!(transfer, progress);
    inner.finish_streamed(job.id, result).await;
}

struct DelegationJob {
    id: u64,
    url: String,
    filename: String,
    destination: PathBuf,
    credential: Credential,
}

async fn run_delegation(inner: Arc<EngineInner>, adapter: ExternalAdapter, job: DelegationJob) {
    let id = job.id;
    let external_id = match adapter
        .delegate(&job.url, &job.filename, &job.destination, &job.credential)
        .await
    {
        Ok(external_id) => external_id,
        Err(error) => {
            warn!(download_id = id, error = %error, "delegation failed");
            inner.fail_delegation(id, error.to_string()).await;
            return;
        }
    };

    let record = {
        let _gate = inner.gate.lock().await;
        let mut active = inner.active.lock().await;
        let record = active.get_mut(&id).map(|entry| {
            entry.handle = TransferHandle::Delegated {
                external_id: Some(external_id),
            };
            entry.record.external_id = Some(external_id);
            entry.record.clone()
        });
        drop(active);
        if let Some(record) = &record {
            inner.persist(record.clone()).await;
        }
        record
    };

    if record.is_none() {
        debug!(download_id = id, external_id, "cancelled during hand-off; withdrawing");
        if let Err(error) = adapter.cancel(external_id).await {
            warn!(download_id = id, external_id, error = %error, "failed to withdraw delegated transfer");
        }
        return;
    }
    inner.ensure_poller().await;
}
