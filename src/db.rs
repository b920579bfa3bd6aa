//! SQLite connection management for the key-value state tables.
//!
//! The engine keeps its durable state (download history, persisted session
//! cookies) as serialized blobs in a single `kv_store` table. This module owns
//! the pool and the embedded migrations that create it.
//!
//! # Example
//!
//! ```no_run
//! use netdisk_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("netdisk.db")).await?;
//! let store = netdisk_core::RecordStore::open(std::sync::Arc::new(
//!     netdisk_core::store::SqliteBackend::new(db),
//! ))
//! .await;
//! # drop(store);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, instrument};

/// One writer at a time; readers rarely overlap in this workload.
const FILE_POOL_SIZE: u32 = 2;

/// How long a connection waits on a locked file before `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database-related errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Failed to open or query the database.
    #[error("failed to connect to database: {0}")]
    Connection(#[from] sqlx::Error),

    /// Failed to apply embedded migrations.
    #[error("failed to run migrations: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Pooled SQLite handle.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the state file at `db_path`, creating it when missing.
    ///
    /// Parent directories are not created. Every pooled connection runs in
    /// WAL mode with a busy timeout, so a second `netdisk` process waits for
    /// the lock instead of failing at once.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when the file cannot be opened or migrated.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        Self::connect(options, FILE_POOL_SIZE).await
    }

    /// Creates a private in-memory database.
    ///
    /// Limited to one connection: each SQLite memory connection is its own
    /// database.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] when the connection or migrations fail.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let options: SqliteConnectOptions = "sqlite::memory:".parse()?;
        Self::connect(options, 1).await
    }

    async fn connect(options: SqliteConnectOptions, max_connections: u32) -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        debug!(max_connections, "state database ready");
        Ok(Self { pool })
    }

    /// Pool used by the key-value backend.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every pooled connection.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}
