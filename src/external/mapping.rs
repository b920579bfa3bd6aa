//! Translation of platform status into record state.

use tracing::warn;

use super::{ExternalStatus, PlatformState};
use crate::lifecycle::{TransferPath, resolve_transition};
use crate::store::{DownloadRecord, DownloadStatus};
use crate::transfer::percent_of;

/// Failure reason stored when the subsystem no longer knows a transfer and
/// nothing was left on disk.
pub const LOST_BY_SUBSYSTEM: &str = "lost by download service";

/// Maps a platform state onto the engine vocabulary.
///
/// Total over every input: unrecognized codes keep `current`.
#[must_use]
pub fn map_platform_state(state: PlatformState, current: DownloadStatus) -> DownloadStatus {
    match state {
        PlatformState::Pending => DownloadStatus::Pending,
        PlatformState::Running => DownloadStatus::Downloading,
        PlatformState::Paused => DownloadStatus::Paused,
        PlatformState::Successful => DownloadStatus::Completed,
        PlatformState::Failed => DownloadStatus::Failed,
        PlatformState::Unknown(_) => current,
    }
}

/// Derives the next version of a delegated `record` from one poll.
///
/// `observed == None` means the subsystem lost the handle; the record then
/// resolves to `COMPLETED` when `destination_exists`, else `FAILED`.
///
/// Returns `None` when no observable field would change, so callers write
/// only on real changes. Terminal records are never changed.
#[must_use]
pub fn reconcile(
    record: &DownloadRecord,
    observed: Option<&ExternalStatus>,
    destination_exists: bool,
) -> Option<DownloadRecord> {
    if record.is_terminal() {
        return None;
    }
    let mut next = record.clone();

    match observed {
        None => {
            warn!(
                download_id = record.id,
                destination_exists,
                "download service lost track of transfer; resolving from disk"
            );
            if destination_exists {
                next.status = DownloadStatus::Completed;
                next.progress_percent = 100;
                if next.bytes_total > 0 {
                    next.bytes_downloaded = next.bytes_total;
                }
            } else {
                next.status = DownloadStatus::Failed;
                next.failure_reason = Some(LOST_BY_SUBSYSTEM.to_string());
            }
        }
        Some(status) => {
            let target = map_platform_state(status.state, record.status);
            next.status = resolve_transition(record.status, target, TransferPath::Delegated);
            next.bytes_downloaded = status.bytes_downloaded;
            next.bytes_total = status.bytes_total;
            if next.bytes_total > 0 && next.bytes_downloaded > next.bytes_total {
                next.bytes_total = next.bytes_downloaded;
            }
            next.progress_percent = match next.status {
                DownloadStatus::Completed => 100,
                DownloadStatus::Failed => record.progress_percent,
                _ => record
                    .progress_percent
                    .max(percent_of(next.bytes_downloaded, next.bytes_total)),
            };
            if next.status == DownloadStatus::Completed && next.bytes_total == 0 {
                next.bytes_total = next.bytes_downloaded;
            }
            if next.status == DownloadStatus::Failed {
                next.failure_reason = Some(format!("download service reported {}", status.state));
            }
        }
    }

    (next != *record).then_some(next)
}
