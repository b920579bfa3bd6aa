//! Presentation events published by the engine.
//!
//! Events are informational; the record store stays authoritative.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// One lifecycle notification for a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A download was accepted.
    Started {
        /// Download id.
        download_id: u64,
        /// Display name.
        filename: String,
    },
    /// Progress moved.
    Progress {
        /// Download id.
        download_id: u64,
        /// Integer percent, 0..=100.
        percent: u8,
        /// Bytes written so far.
        bytes_downloaded: u64,
        /// Expected size; `0` when unknown.
        bytes_total: u64,
    },
    /// The download ended, or was cancelled.
    Finished {
        /// Download id.
        download_id: u64,
        /// Whether the content is complete on disk.
        success: bool,
        /// Openable path on success.
        destination_path: Option<PathBuf>,
    },
}

impl EngineEvent {
    /// Id of the download this event concerns.
    #[must_use]
    pub fn download_id(&self) -> u64 {
        match self {
            Self::Started { download_id, .. }
            | Self::Progress { download_id, .. }
            | Self::Finished { download_id, .. } => *download_id,
        }
    }
}

/// Fan-out of [`EngineEvent`]s to any number of subscribers.
///
/// Slow receivers observe `RecvError::Lagged` once the buffer fills.
#[derive(Debug)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishing with no subscribers drops the event.
    pub(crate) fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// MIME type for opening a finished file, chosen by extension.
#[must_use]
pub fn media_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("flac") => "audio/flac",
        Some("ogg") => "audio/ogg",
        Some("mp4") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        Some("zip") => "application/zip",
        _ => "*/*",
    }
}
