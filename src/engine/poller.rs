//! Reconciliation of delegated transfers.
//!
//! A single task polls the external subsystem for every delegated transfer
//! that has a handle, at the configured interval. It is started on demand
//! and exits as soon as no polled transfer remains.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{EngineEvent, EngineInner, TransferStrategy};
use crate::external::{ExternalAdapter, reconcile};
use crate::store::DownloadStatus;

impl EngineInner {
    /// Starts the poller unless one is already running.
    pub(super) async fn ensure_poller(self: &Arc<Self>) {
        let TransferStrategy::Delegated(adapter) = &self.strategy else {
            return;
        };
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut slot = self.poller.lock().await;
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *slot = Some(tokio::spawn(poll_loop(Arc::clone(self), adapter.clone())));
    }

    /// One pass over every polled transfer.
    async fn reconcile_delegated(&self, adapter: &ExternalAdapter) {
        let handles: Vec<(u64, i64)> = self
            .active
            .lock()
            .await
            .iter()
            .filter_map(|(id, entry)| entry.polled_handle().map(|external_id| (*id, external_id)))
            .collect();

        for (id, external_id) in handles {
            let observed = match adapter.poll_status(external_id).await {
                Ok(observed) => observed,
                Err(error) => {
                    warn!(download_id = id, external_id, error = %error, "status poll failed");
                    continue;
                }
            };

            let _gate = self.gate.lock().await;
            let mut active = self.active.lock().await;
            // Cancelled while the poll was in flight.
            let Some(entry) = active.get_mut(&id) else {
                continue;
            };
            let destination_exists = observed.is_none()
                && tokio::fs::try_exists(&entry.record.destination_path)
                    .await
                    .unwrap_or(false);
            let Some(next) = reconcile(&entry.record, observed.as_ref(), destination_exists)
            else {
                continue;
            };

            entry.record = next.clone();
            let finished = next.is_terminal();
            if finished {
                active.remove(&id);
            }
            drop(active);

            let event = if finished {
                let success = next.status == DownloadStatus::Completed;
                info!(download_id = id, status = %next.status, "delegated transfer finished");
                EngineEvent::Finished {
                    download_id: id,
                    success,
                    destination_path: success.then(|| next.destination_path.clone()),
                }
            } else {
                debug!(download_id = id, status = %next.status, percent = next.progress_percent, "delegated transfer progressed");
                EngineEvent::Progress {
                    download_id: id,
                    percent: next.progress_percent,
                    bytes_downloaded: next.bytes_downloaded,
                    bytes_total: next.bytes_total,
                }
            };
            self.persist(next).await;
            self.events.publish(event);
        }
    }

    /// Clears the poller slot when nothing is left to poll. Returns whether
    /// the poller should stop.
    async fn retire_poller_if_idle(&self) -> bool {
        let mut slot = self.poller.lock().await;
        let idle = !self
            .active
            .lock()
            .await
            .values()
            .any(|entry| entry.polled_handle().is_some());
        if idle {
            *slot = None;
        }
        idle
    }
}

async fn poll_loop(inner: Arc<EngineInner>, adapter: ExternalAdapter) {
    let mut ticker = tokio::time::interval(inner.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(
        poll_interval_ms = u64::try_from(inner.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
        "reconciliation poller started"
    );

    loop {
        tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => {
                debug!("reconciliation poller shutting down");
                break;
            }
            _ = ticker.tick() => {}
        }

        inner.reconcile_delegated(&adapter).await;
        if inner.retire_poller_if_idle().await {
            debug!("no delegated transfers left; reconciliation poller stopped");
            break;
        }
    }
}
