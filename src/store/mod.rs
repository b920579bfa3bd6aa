//! Durable download history.
//!
//! The store keeps the full record collection in memory and writes the whole
//! serialized snapshot under [`RECORDS_KEY`] after every mutation. The
//! snapshot is ordered most-recently-touched first. A write that the backend
//! rejects leaves the in-memory collection untouched, so memory and storage
//! never diverge.
//!
//! Unreadable stored data (missing, corrupt, unknown shape) loads as an empty
//! history rather than an error. A backend that fails the initial read is
//! different: the store stays unloaded and retries the read before any write,
//! so a transient outage never overwrites the saved collection.

mod backend;
mod error;
mod record;

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, instrument, warn};

pub use backend::{AUTH_COOKIES_KEY, KeyValueBackend, MemoryBackend, RECORDS_KEY, SqliteBackend};
pub use error::{StorageFailureKind, StoreError};
pub use record::{DownloadRecord, DownloadStatus};

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Ordered, persisted collection of download records.
pub struct RecordStore {
    backend: Arc<dyn KeyValueBackend>,
    snapshot: Mutex<Snapshot>,
}

#[derive(Debug, Default)]
struct Snapshot {
    records: Vec<DownloadRecord>,
    /// False until the backend has been read successfully once.
    loaded: bool,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore").finish_non_exhaustive()
    }
}

impl RecordStore {
    /// Loads the persisted collection from `backend`.
    ///
    /// Never fails. Undecodable data yields an empty history. When the
    /// backend itself fails, the store opens unloaded: reads see an empty
    /// history and writes retry the load first.
    #[instrument(skip(backend))]
    pub async fn open(backend: Arc<dyn KeyValueBackend>) -> Self {
        let snapshot = match read_records(backend.as_ref()).await {
            Ok(records) => {
                debug!(records = records.len(), "download history loaded");
                Snapshot {
                    records,
                    loaded: true,
                }
            }
            Err(error) => {
                warn!(error = %error, "download history unavailable; will retry before writing");
                Snapshot::default()
            }
        };
        Self {
            backend,
            snapshot: Mutex::new(snapshot),
        }
    }

    /// Whether the saved collection has been read.
    pub async fn is_loaded(&self) -> bool {
        self.snapshot.lock().await.loaded
    }

    /// Locks the snapshot, reading the backend first if the initial load
    /// failed.
    async fn loaded(&self) -> Result<MutexGuard<'_, Snapshot>> {
        let mut snapshot = self.snapshot.lock().await;
        if !snapshot.loaded {
            snapshot.records = read_records(self.backend.as_ref()).await?;
            snapshot.loaded = true;
            debug!(records = snapshot.records.len(), "download history loaded on retry");
        }
        Ok(snapshot)
    }

    /// Snapshot for read-only queries; an unreachable backend reads as empty.
    async fn readable(&self) -> Option<MutexGuard<'_, Snapshot>> {
        match self.loaded().await {
            Ok(snapshot) => Some(snapshot),
            Err(error) => {
                debug!(error = %error, "download history still unavailable");
                None
            }
        }
    }

    /// Returns the backend this store writes through to.
    #[must_use]
    pub fn backend(&self) -> Arc<dyn KeyValueBackend> {
        Arc::clone(&self.backend)
    }

    /// Inserts or replaces the record with the same id and moves it to the
    /// front of the listing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the saved collection cannot be read or the
    /// new snapshot cannot be serialized or written. The collection is left
    /// as it was.
    #[instrument(level = "debug", skip(self, record), fields(download_id = record.id, status = %record.status))]
    pub async fn put(&self, record: DownloadRecord) -> Result<()> {
        let mut snapshot = self.loaded().await?;
        let mut next = snapshot.records.clone();
        next.retain(|existing| existing.id != record.id);
        next.insert(0, record);
        self.persist(&next).await?;
        snapshot.records = next;
        Ok(())
    }

    /// Returns a copy of the record with `id`.
    pub async fn get(&self, id: u64) -> Option<DownloadRecord> {
        self.readable()
            .await?
            .records
            .iter()
            .find(|record| record.id == id)
            .cloned()
    }

    /// Returns every record, most recently updated first.
    pub async fn list_all(&self) -> Vec<DownloadRecord> {
        self.readable()
            .await
            .map(|snapshot| snapshot.records.clone())
            .unwrap_or_default()
    }

    /// Removes the record with `id`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the saved collection cannot be read or the
    /// new snapshot cannot be written.
    #[instrument(level = "debug", skip(self))]
    pub async fn delete(&self, id: u64) -> Result<bool> {
        let mut snapshot = self.loaded().await?;
        if !snapshot.records.iter().any(|record| record.id == id) {
            return Ok(false);
        }
        let next: Vec<DownloadRecord> = snapshot
            .records
            .iter()
            .filter(|record| record.id != id)
            .cloned()
            .collect();
        self.persist(&next).await?;
        snapshot.records = next;
        Ok(true)
    }

    /// Removes every record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the empty snapshot cannot be written.
    #[instrument(level = "debug", skip(self))]
    pub async fn clear(&self) -> Result<()> {
        let mut snapshot = self.snapshot.lock().await;
        self.persist(&[]).await?;
        snapshot.records.clear();
        snapshot.loaded = true;
        Ok(())
    }

    /// Highest id present, used to seed id allocation after a restart.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the saved collection cannot be read, since
    /// seeding from an unknown history could hand out ids that are taken.
    pub async fn max_id(&self) -> Result<Option<u64>> {
        let snapshot = self.loaded().await?;
        Ok(snapshot.records.iter().map(|record| record.id).max())
    }

    async fn persist(&self, records: &[DownloadRecord]) -> Result<()> {
        let raw = serde_json::to_string(records)?;
        self.backend.save(RECORDS_KEY, &raw).await
    }
}

async fn read_records(backend: &dyn KeyValueBackend) -> Result<Vec<DownloadRecord>> {
    Ok(backend
        .load(RECORDS_KEY)
        .await?
        .map(|raw| decode_records(&raw))
        .unwrap_or_default())
}

fn decode_records(raw: &str) -> Vec<DownloadRecord> {
    match serde_json::from_str::<Vec<DownloadRecord>>(raw) {
        Ok(mut records) => {
            // Keep the first (most recent) entry if an older writer duplicated ids.
            let mut seen = std::collections::HashSet::new();
            records.retain(|record| seen.insert(record.id));
            records
        }
        Err(error) => {
            warn!(error = %error, "stored download history is unreadable; starting empty");
            Vec::new()
        }
    }
}
