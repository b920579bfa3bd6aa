//! Key-value storage seam behind the record store.
//!
//! The engine persists whole serialized collections under fixed keys, so the
//! backend contract is a plain string map. `SqliteBackend` is the durable
//! implementation; `MemoryBackend` serves tests and ephemeral runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::instrument;

use super::{Result, StoreError};
use crate::db::Database;

/// Storage key of the serialized download record collection.
pub const RECORDS_KEY: &str = "download_records";

/// Storage key of the persisted session cookie.
pub const AUTH_COOKIES_KEY: &str = "auth_cookies";

/// Data-access contract for keyed blobs.
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Reads the value stored under `key`.
    async fn load(&self, key: &str) -> Result<Option<String>>;

    /// Replaces the value stored under `key`.
    async fn save(&self, key: &str, value: &str) -> Result<()>;

    /// Removes `key` if present.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// `kv_store` table in the application database.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    db: Database,
}

impl SqliteBackend {
    /// Wraps an open database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl KeyValueBackend for SqliteBackend {
    #[instrument(level = "debug", skip(self))]
    async fn load(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.map(|(value,)| value))
    }

    #[instrument(level = "debug", skip(self, value), fields(bytes = value.len()))]
    async fn save(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r"INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, datetime('now'))
              ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

/// Process-local map. Writes can be switched off to exercise failure paths.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend pre-seeded with one entry.
    #[must_use]
    pub fn with_entry(key: &str, value: &str) -> Self {
        let backend = Self::default();
        backend
            .lock()
            .insert(key.to_string(), value.to_string());
        backend
    }

    /// While set, every operation fails with `StorageFailureKind::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns the raw stored value, bypassing the availability switch.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("memory backend switched off"));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueBackend for MemoryBackend {
    async fn load(&self, key: &str) -> Result<Option<String>> {
        self.check_available()?;
        Ok(self.lock().get(key).cloned())
    }

    async fn save(&self, key: &str, value: &str) -> Result<()> {
        self.check_available()?;
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.lock().remove(key);
        Ok(())
    }
}
