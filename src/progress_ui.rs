//! Progress bar for a single `netdisk get`.

use std::path::PathBuf;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use netdisk_core::EngineEvent;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

/// How a followed download ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FollowOutcome {
    pub(crate) success: bool,
    pub(crate) destination_path: Option<PathBuf>,
}

/// Renders events for `download_id` until it finishes.
///
/// Returns `None` when the event stream closes first. When `show_bar` is
/// false nothing is drawn.
pub(crate) async fn follow_download(
    mut events: broadcast::Receiver<EngineEvent>,
    download_id: u64,
    show_bar: bool,
) -> Option<FollowOutcome> {
    let bar = if show_bar {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg} {bytes}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        bar
    } else {
        ProgressBar::hidden()
    };

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "progress display fell behind");
                continue;
            }
            Err(RecvError::Closed) => {
                bar.abandon();
                return None;
            }
        };
        if event.download_id() != download_id {
            continue;
        }

        match event {
            EngineEvent::Started { filename, .. } => bar.set_message(filename),
            EngineEvent::Progress {
                bytes_downloaded,
                bytes_total,
                ..
            } => {
                if bytes_total > 0 && bar.length() != Some(bytes_total) {
                    bar.set_length(bytes_total);
                    bar.set_style(
                        ProgressStyle::with_template(
                            "{msg} [{bar:30}] {bytes}/{total_bytes} ({percent}%)",
                        )
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                    );
                }
                bar.set_position(bytes_downloaded);
            }
            EngineEvent::Finished {
                success,
                destination_path,
                ..
            } => {
                if success {
                    bar.finish();
                } else {
                    bar.abandon();
                }
                return Some(FollowOutcome {
                    success,
                    destination_path,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_follow_ignores_other_downloads_and_reports_outcome() {
        let (tx, rx) = broadcast::channel(16);
        let events = [
            EngineEvent::Started {
                download_id: 2,
                filename: "other".into(),
            },
            EngineEvent::Started {
                download_id: 1,
                filename: "a.zip".into(),
            },
            EngineEvent::Progress {
                download_id: 1,
                percent: 50,
                bytes_downloaded: 5,
                bytes_total: 10,
            },
            EngineEvent::Finished {
                download_id: 2,
                success: false,
                destination_path: None,
            },
            EngineEvent::Finished {
                download_id: 1,
                success: true,
                destination_path: Some(PathBuf::from("/d/a.zip")),
            },
        ];
        for event in events {
            let _ = tx.send(event);
        }

        let outcome = follow_download(rx, 1, false).await;

        assert_eq!(
            outcome,
            Some(FollowOutcome {
                success: true,
                destination_path: Some(PathBuf::from("/d/a.zip")),
            })
        );
    }

    #[tokio::test]
    async fn test_follow_returns_none_when_stream_closes() {
        let (tx, rx) = broadcast::channel::<EngineEvent>(4);
        drop(tx);

        assert_eq!(follow_download(rx, 1, false).await, None);
    }
}
