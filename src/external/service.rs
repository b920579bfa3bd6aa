//! In-process stand-in for an OS download manager.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DelegatedRequest, ExternalError, ExternalStatus, ExternalSubsystem, PlatformState};
use crate::transfer::TransferExecutor;

#[derive(Debug)]
struct Job {
    status: ExternalStatus,
    cancel: CancellationToken,
}

/// Background download manager that runs transfers on its own tasks and
/// answers status queries by handle.
///
/// Jobs keep their final status after finishing until [`remove`] is called,
/// mirroring how platform download services report completed transfers.
///
/// [`remove`]: ExternalSubsystem::remove
#[derive(Debug)]
pub struct BackgroundDownloadService {
    executor: TransferExecutor,
    jobs: Arc<DashMap<i64, Job>>,
    next_id: AtomicI64,
}

impl BackgroundDownloadService {
    /// Creates a service that fetches with `executor`.
    #[must_use]
    pub fn new(executor: TransferExecutor) -> Self {
        Self {
            executor,
            jobs: Arc::new(DashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Starts handle allocation after `last`, so handles saved by an earlier
    /// process are never handed out again.
    #[must_use]
    pub fn with_ids_after(self, last: Option<i64>) -> Self {
        let first = last.map_or(1, |last| last.saturating_add(1).max(1));
        self.next_id.store(first, Ordering::Relaxed);
        self
    }

    /// Number of handles currently known.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

fn update(jobs: &DashMap<i64, Job>, id: i64, apply: impl FnOnce(&mut ExternalStatus)) {
    if let Some(mut job) = jobs.get_mut(&id) {
        apply(&mut job.status);
    }
}

#[async_trait]
impl ExternalSubsystem for BackgroundDownloadService {
    async fn enqueue(&self, request: DelegatedRequest) -> Result<i64, ExternalError> {
        if request.url.trim().is_empty() {
            return Err(ExternalError::Rejected {
                url: request.url,
                reason: "empty url".to_string(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        self.jobs.insert(
            id,
            Job {
                status: ExternalStatus {
                    state: PlatformState::Pending,
                    bytes_downloaded: 0,
                    bytes_total: 0,
                },
                cancel: cancel.clone(),
            },
        );
        debug!(external_id = id, url = %request.url, "job accepted");

        let jobs = Arc::clone(&self.jobs);
        let executor = self.executor.clone();
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let transfer_id = u64::try_from(id).unwrap_or_default();
            let transfer = async {
                let result = executor
                    .execute(
                        transfer_id,
                        &request.url,
                        &request.destination,
                        &request.credential,
                        &tx,
                        &cancel,
                    )
                    .await;
                drop(tx);
                result
            };
            let observe = async {
                while let Some(sample) = rx.recv().await {
                    update(&jobs, id, |status| {
                        status.state = PlatformState::Running;
                        status.bytes_downloaded = sample.bytes_downloaded;
                        status.bytes_total = sample.bytes_total;
                    });
                }
            };
            let (result, ()) = tokio::join!(transfer, observe);

            match result {
                Ok(outcome) => {
                    info!(external_id = id, bytes = outcome.bytes_downloaded, "job finished");
                    update(&jobs, id, |status| {
                        status.state = PlatformState::Successful;
                        status.bytes_downloaded = outcome.bytes_downloaded;
                        status.bytes_total = outcome.bytes_total;
                    });
                }
                Err(error) if error.is_cancelled() => {
                    debug!(external_id = id, "job cancelled");
                }
                Err(error) => {
                    warn!(external_id = id, error = %error, "job failed");
                    update(&jobs, id, |status| status.state = PlatformState::Failed);
                }
            }
        });

        Ok(id)
    }

    async fn query(&self, external_id: i64) -> Result<Option<ExternalStatus>, ExternalError> {
        Ok(self.jobs.get(&external_id).map(|job| job.status))
    }

    async fn remove(&self, external_id: i64) -> Result<(), ExternalError> {
        if let Some((_, job)) = self.jobs.remove(&external_id) {
            job.cancel.cancel();
            debug!(external_id, "job removed");
        }
        Ok(())
    }
}
