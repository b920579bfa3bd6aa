//! Download state machine.
//!
//! ```text
//! PENDING ──► DOWNLOADING ──► COMPLETED
//!    │             │      └─► FAILED
//!    ├─────────────┴──► PAUSED (delegated transfers only)
//!    └──► COMPLETED | FAILED
//! ```
//!
//! `PENDING` may finish without passing through `DOWNLOADING`. A request that
//! fails before any byte arrives goes straight to `FAILED`, and a delegated job
//! can complete between two polls, so the poller never observes it running.
//! Streamed transfers always report their 0% sample before finishing, so they
//! only take the direct `COMPLETED` edge if that sample is lost.
//!
//! `PAUSED` resumes to `PENDING` or `DOWNLOADING`, or finishes directly.
//! Nothing leaves `COMPLETED` or `FAILED`, and `DOWNLOADING` never falls back
//! to `PENDING`.

use thiserror::Error;
use tracing::debug;

use crate::store::DownloadStatus;

/// How a transfer is carried out. Only delegated transfers can pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPath {
    /// Streamed by this process.
    Streamed,
    /// Handed to the external download subsystem.
    Delegated,
}

/// A rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid status transition {from} -> {to} for {path:?} transfer")]
pub struct InvalidTransition {
    /// Current state.
    pub from: DownloadStatus,
    /// Requested state.
    pub to: DownloadStatus,
    /// Transfer path the request came from.
    pub path: TransferPath,
}

/// Checks whether `from -> to` is allowed on `path`.
///
/// Staying in the same non-terminal state is allowed (progress updates).
///
/// # Errors
///
/// Returns [`InvalidTransition`] for every other change the state machine
/// forbids.
pub fn check_transition(
    from: DownloadStatus,
    to: DownloadStatus,
    path: TransferPath,
) -> Result<(), InvalidTransition> {
    use DownloadStatus::{Completed, Downloading, Failed, Paused, Pending};

    let allowed = if from.is_terminal() {
        false
    } else if from == to {
        true
    } else {
        match (from, to) {
            (_, Completed | Failed) | (Pending | Paused, Downloading) | (Paused, Pending) => true,
            (Pending | Downloading, Paused) => path == TransferPath::Delegated,
            _ => false,
        }
    };
    if allowed {
        Ok(())
    } else {
        Err(InvalidTransition { from, to, path })
    }
}

/// Applies `to` when allowed, otherwise keeps `from`.
#[must_use]
pub fn resolve_transition(
    from: DownloadStatus,
    to: DownloadStatus,
    path: TransferPath,
) -> DownloadStatus {
    match check_transition(from, to, path) {
        Ok(()) => to,
        Err(rejected) => {
            debug!(error = %rejected, "ignoring status change");
            from
        }
    }
}
