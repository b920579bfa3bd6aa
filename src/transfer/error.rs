//! Error types for in-process transfers.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that end a transfer. All of them are terminal; nothing is retried.
#[derive(Debug, Error)]
pub enum TransferError {
    /// DNS, connection, TLS or body-stream failure.
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL being fetched.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// Connect or read deadline elapsed.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL being fetched.
        url: String,
    },

    /// Server answered with a non-success status.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL being fetched.
        url: String,
        /// The status code.
        status: u16,
    },

    /// Creating or writing the destination failed.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// Destination path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The URL is malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The rejected input.
        url: String,
    },

    /// The transfer was cancelled before it finished.
    #[error("download of {url} cancelled")]
    Cancelled {
        /// The URL being fetched.
        url: String,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

impl TransferError {
    /// Maps a client error, separating timeouts.
    pub fn from_reqwest(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout { url: url.into() }
        } else {
            Self::Network {
                url: url.into(),
                source,
            }
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a cancellation error.
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// Whether the transfer ended because it was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Short reason stored on the failed record.
    #[must_use]
    pub fn diagnostic(&self) -> String {
        match self {
            Self::HttpStatus { status, .. } => format!("HTTP {status}"),
            Self::Timeout { .. } => "timeout".to_string(),
            Self::Network { source, .. } => format!("network: {source}"),
            Self::Io { source, .. } => format!("io: {source}"),
            Self::InvalidUrl { .. } => "invalid URL".to_string(),
            Self::Cancelled { .. } => "cancelled".to_string(),
            Self::ClientBuild(source) => format!("client: {source}"),
        }
    }
}
