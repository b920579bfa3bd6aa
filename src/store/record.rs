//! Download record and status definitions.
//!
//! Records are serialized with camelCase field names. Older history entries
//! used `downloadId`, `url`, `filePath`, `progress`, `downloadedSize`,
//! `totalSize` and `timestamp`; those names are accepted on read.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Lifecycle state of a download record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    /// Submitted, no bytes observed yet.
    Pending,
    /// Bytes are flowing.
    Downloading,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished unsuccessfully. Terminal.
    Failed,
    /// Suspended by the external download subsystem.
    Paused,
}

impl DownloadStatus {
    /// Returns the persisted string representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Downloading => "DOWNLOADING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Paused => "PAUSED",
        }
    }

    /// `COMPLETED` and `FAILED` are terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "DOWNLOADING" => Ok(Self::Downloading),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "PAUSED" => Ok(Self::Paused),
            _ => Err(format!("invalid download status: {s}")),
        }
    }
}

/// Durable state of one submitted transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    /// Engine-assigned id, never reused.
    #[serde(alias = "downloadId")]
    pub id: u64,
    /// Display and destination name.
    pub filename: String,
    /// Origin URL, also used to re-derive credentials.
    #[serde(alias = "url")]
    pub source_url: String,
    /// Absolute path the content is (or will be) written to.
    #[serde(alias = "filePath")]
    pub destination_path: PathBuf,
    /// Current lifecycle state.
    pub status: DownloadStatus,
    /// 0..=100; only meaningful while downloading.
    #[serde(alias = "progress", default, deserialize_with = "lenient_percent")]
    pub progress_percent: u8,
    /// Bytes written so far.
    #[serde(alias = "downloadedSize", default, deserialize_with = "lenient_size")]
    pub bytes_downloaded: u64,
    /// Expected size; `0` means unknown.
    #[serde(alias = "totalSize", default, deserialize_with = "lenient_size")]
    pub bytes_total: u64,
    /// Creation time, stored as epoch milliseconds.
    #[serde(alias = "timestamp", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// Handle in the external download subsystem for delegated transfers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<i64>,
    /// Short diagnostic for failed transfers, e.g. `HTTP 404`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl DownloadRecord {
    /// Creates a fresh `PENDING` record.
    #[must_use]
    pub fn pending(
        id: u64,
        filename: impl Into<String>,
        source_url: impl Into<String>,
        destination_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id,
            filename: filename.into(),
            source_url: source_url.into(),
            destination_path: destination_path.into(),
            status: DownloadStatus::Pending,
            progress_percent: 0,
            bytes_downloaded: 0,
            bytes_total: 0,
            created_at: Utc::now(),
            external_id: None,
            failure_reason: None,
        }
    }

    /// Shorthand for `self.status.is_terminal()`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the transfer was handed to the external subsystem.
    #[must_use]
    pub fn is_delegated(&self) -> bool {
        self.external_id.is_some()
    }
}

// Older writers stored -1 for unknown sizes; clamp instead of rejecting the
// whole collection.
fn lenient_size<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = i64::deserialize(deserializer)?;
    Ok(u64::try_from(raw).unwrap_or(0))
}

fn lenient_percent<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = i64::deserialize(deserializer)?;
    Ok(u8::try_from(raw.clamp(0, 100)).unwrap_or(0))
}
