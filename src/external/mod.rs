//! Delegation to an OS-level download facility.
//!
//! The engine can hand transfers to an external subsystem instead of
//! streaming them itself. The subsystem is addressed through the
//! [`ExternalSubsystem`] seam using opaque numeric handles; its status
//! vocabulary ([`PlatformState`]) is translated onto the engine's states by
//! [`map_platform_state`] and [`reconcile`].

mod mapping;
mod service;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, instrument};

pub use mapping::{LOST_BY_SUBSYSTEM, map_platform_state, reconcile};
pub use service::BackgroundDownloadService;

use crate::auth::Credential;

/// Status codes reported by the platform download service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformState {
    /// Waiting to start (code 1).
    Pending,
    /// Transferring (code 2).
    Running,
    /// Suspended, e.g. waiting for connectivity (code 4).
    Paused,
    /// Finished successfully (code 8).
    Successful,
    /// Finished unsuccessfully (code 16).
    Failed,
    /// A code this build does not know.
    Unknown(i32),
}

impl PlatformState {
    /// Decodes a raw platform status code.
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Pending,
            2 => Self::Running,
            4 => Self::Paused,
            8 => Self::Successful,
            16 => Self::Failed,
            other => Self::Unknown(other),
        }
    }

    /// Raw platform status code.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Pending => 1,
            Self::Running => 2,
            Self::Paused => 4,
            Self::Successful => 8,
            Self::Failed => 16,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for PlatformState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "unknown({code})"),
            known => write!(f, "{known:?}"),
        }
    }
}

/// One status observation of a delegated transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalStatus {
    /// Platform state.
    pub state: PlatformState,
    /// Bytes written so far.
    pub bytes_downloaded: u64,
    /// Expected size; `0` when unknown.
    pub bytes_total: u64,
}

/// What the subsystem needs to run a transfer.
#[derive(Debug, Clone)]
pub struct DelegatedRequest {
    /// Source URL.
    pub url: String,
    /// Display name.
    pub filename: String,
    /// Absolute destination path.
    pub destination: PathBuf,
    /// `Cookie` header value; may be empty.
    pub credential: Credential,
}

/// Errors talking to the external subsystem.
#[derive(Debug, Error)]
pub enum ExternalError {
    /// The subsystem refused the request.
    #[error("download service rejected {url}: {reason}")]
    Rejected {
        /// Request URL.
        url: String,
        /// Reason given by the subsystem.
        reason: String,
    },

    /// The subsystem could not be reached.
    #[error("download service unavailable: {0}")]
    Unavailable(String),
}

/// Contract of an OS-managed download facility.
#[async_trait]
pub trait ExternalSubsystem: Send + Sync {
    /// Starts a transfer and returns its handle.
    async fn enqueue(&self, request: DelegatedRequest) -> Result<i64, ExternalError>;

    /// Current status, or `None` when the handle is unknown.
    async fn query(&self, external_id: i64) -> Result<Option<ExternalStatus>, ExternalError>;

    /// Stops the transfer and forgets the handle.
    async fn remove(&self, external_id: i64) -> Result<(), ExternalError>;
}

/// Engine-side wrapper around an [`ExternalSubsystem`].
#[derive(Clone)]
pub struct ExternalAdapter {
    subsystem: Arc<dyn ExternalSubsystem>,
}

impl fmt::Debug for ExternalAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalAdapter").finish_non_exhaustive()
    }
}

impl ExternalAdapter {
    /// Wraps a subsystem.
    #[must_use]
    pub fn new(subsystem: Arc<dyn ExternalSubsystem>) -> Self {
        Self { subsystem }
    }

    /// Hands a transfer to the subsystem.
    ///
    /// # Errors
    ///
    /// Returns [`ExternalError`] when the subsystem refuses or is unreachable.
    #[instrument(skip(self, credential), fields(url = %url, path = %destination.display()))]
    pub async fn delegate(
        &self,
        url: &str,
        filename: &str,
        destination: &Path,
        credential: &Credential,
    ) -> Result<i64, ExternalError> {
        let external_id = self
            .subsystem
            .enqueue(DelegatedRequest {
                url: url.to_string(),
                filename: filename.to_string(),
                destination: destination.to_path_buf(),
                credential: credential.clone(),
            })
            .await?;
        debug!(external_id, "transfer delegated");
        Ok(external_id)
    }

    /// Polls one handle.
    ///
    /// # Errors
    ///
    /// Returns [`ExternalError`] when the subsystem cannot be queried.
    pub async fn poll_status(
        &self,
        external_id: i64,
    ) -> Result<Option<ExternalStatus>, ExternalError> {
        self.subsystem.query(external_id).await
    }

    /// Requests cancellation of one handle.
    ///
    /// # Errors
    ///
    /// Returns [`ExternalError`] when the subsystem cannot be reached.
    #[instrument(skip(self))]
    pub async fn cancel(&self, external_id: i64) -> Result<(), ExternalError> {
        self.subsystem.remove(external_id).await
    }
}
