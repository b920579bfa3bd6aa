//! Error types for record persistence.

use std::fmt;

use thiserror::Error;

/// Coarse classification of storage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFailureKind {
    /// `SQLite` reported the database busy or locked.
    BusyOrLocked,
    /// The connection pool was closed or timed out.
    PoolUnavailable,
    /// Filesystem or transport IO failure.
    Io,
    /// Storage refused writes (simulated or read-only medium).
    Unavailable,
    /// Anything else.
    Other,
}

impl StorageFailureKind {
    /// Classifies a sqlx error.
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => Self::PoolUnavailable,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Database(database_error) => {
                let code = database_error.code();
                if matches!(code.as_deref(), Some("5" | "6" | "SQLITE_BUSY" | "SQLITE_LOCKED"))
                    || database_error.message().contains("database is locked")
                {
                    Self::BusyOrLocked
                } else {
                    Self::Other
                }
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for StorageFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::PoolUnavailable => "pool_unavailable",
            Self::Io => "io",
            Self::Unavailable => "unavailable",
            Self::Other => "other",
        };
        f.write_str(label)
    }
}

/// Errors surfaced by the record store. None of them are fatal to a transfer.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backing key-value storage rejected the read or write.
    #[error("storage error ({kind}): {message}")]
    Storage {
        /// Failure classification.
        kind: StorageFailureKind,
        /// Human-readable cause.
        message: String,
    },

    /// The record collection could not be serialized.
    #[error("failed to serialize download records: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage {
            kind: StorageFailureKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl StoreError {
    /// Creates an error for storage that refuses access.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Storage {
            kind: StorageFailureKind::Unavailable,
            message: message.into(),
        }
    }

    /// Returns the storage failure classification, if any.
    #[must_use]
    pub fn storage_kind(&self) -> Option<StorageFailureKind> {
        match self {
            Self::Storage { kind, .. } => Some(*kind),
            Self::Serialization(_) => None,
        }
    }
}
