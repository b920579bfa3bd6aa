//! Integration tests for the engine with transfers delegated to an external
//! download subsystem.

#![allow(clippy::unwrap_used)]

mod support;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use netdisk_core::engine::EngineEvent;
use netdisk_core::external::{
    DelegatedRequest, ExternalError, ExternalStatus, ExternalSubsystem, LOST_BY_SUBSYSTEM,
    PlatformState,
};
use netdisk_core::store::{DownloadRecord, DownloadStatus, MemoryBackend, RECORDS_KEY};
use netdisk_core::{DownloadEngine, EngineConfig, RecordStore, TransferMode};
use support::socket_guard::start_mock_server_or_skip;
use support::{
    collect_until_finished, memory_engine, wait_for_record, wait_for_status, wait_for_terminal,
};
use tempfile::TempDir;
use wiremock::matchers::method;
use wiremock::{Mock, ResponseTemplate};

/// Subsystem whose answers are set by the test.
#[derive(Default)]
struct ScriptedSubsystem {
    next_id: AtomicI64,
    reject: AtomicBool,
    /// `None` means the subsystem has lost the handle.
    statuses: Mutex<HashMap<i64, Option<ExternalStatus>>>,
    requests: Mutex<Vec<DelegatedRequest>>,
    removed: Mutex<Vec<i64>>,
}

impl ScriptedSubsystem {
    fn set(&self, external_id: i64, state: PlatformState, bytes: u64, total: u64) {
        self.statuses.lock().unwrap().insert(
            external_id,
            Some(ExternalStatus {
                state,
                bytes_downloaded: bytes,
                bytes_total: total,
            }),
        );
    }

    fn lose(&self, external_id: i64) {
        self.statuses.lock().unwrap().insert(external_id, None);
    }

    fn removed(&self) -> Vec<i64> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExternalSubsystem for ScriptedSubsystem {
    async fn enqueue(&self, request: DelegatedRequest) -> Result<i64, ExternalError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(ExternalError::Rejected {
                url: request.url,
                reason: "storage full".to_string(),
            });
        }
        let external_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 100;
        self.requests.lock().unwrap().push(request);
        self.set(external_id, PlatformState::Pending, 0, 0);
        Ok(external_id)
    }

    async fn query(&self, external_id: i64) -> Result<Option<ExternalStatus>, ExternalError> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(&external_id)
            .copied()
            .flatten())
    }

    async fn remove(&self, external_id: i64) -> Result<(), ExternalError> {
        self.removed.lock().unwrap().push(external_id);
        self.statuses.lock().unwrap().remove(&external_id);
        Ok(())
    }
}

fn delegated_config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        download_dir: dir.path().to_path_buf(),
        transfer_mode: TransferMode::Delegated,
        poll_interval: Duration::from_millis(25),
        ..EngineConfig::default()
    }
}

async fn scripted_engine(dir: &TempDir) -> (DownloadEngine, Arc<ScriptedSubsystem>) {
    let subsystem = Arc::new(ScriptedSubsystem::default());
    let engine = DownloadEngine::builder(delegated_config(dir))
        .external(subsystem.clone())
        .build()
        .await
        .unwrap();
    (engine, subsystem)
}

async fn submit_and_wait_for_handle(engine: &DownloadEngine, name: &str) -> (u64, i64) {
    let id = engine
        .submit(&format!("https://pan.example.com/{name}"), name)
        .await
        .unwrap();
    let record = wait_for_record(engine, id, |record| record.external_id.is_some())
        .await
        .unwrap();
    (id, record.external_id.unwrap())
}

#[tokio::test]
async fn test_delegated_transfer_follows_subsystem_states() {
    let dir = TempDir::new().unwrap();
    let (engine, subsystem) = scripted_engine(&dir).await;
    let mut events = engine.subscribe();

    let (id, external_id) = submit_and_wait_for_handle(&engine, "movie.mp4").await;
    let request = subsystem.requests.lock().unwrap()[0].clone();
    assert_eq!(request.destination, dir.path().join("movie.mp4"));

    subsystem.set(external_id, PlatformState::Running, 250, 1000);
    let record = wait_for_status(&engine, id, |s| s == DownloadStatus::Downloading)
        .await
        .unwrap();
    assert_eq!(record.progress_percent, 25);

    subsystem.set(external_id, PlatformState::Paused, 250, 1000);
    wait_for_status(&engine, id, |s| s == DownloadStatus::Paused)
        .await
        .unwrap();

    subsystem.set(external_id, PlatformState::Running, 750, 1000);
    let record = wait_for_record(&engine, id, |r| r.progress_percent == 75)
        .await
        .unwrap();
    assert_eq!(record.status, DownloadStatus::Downloading);

    subsystem.set(external_id, PlatformState::Successful, 1000, 1000);
    let record = wait_for_terminal(&engine, id).await.unwrap();
    assert_eq!(record.status, DownloadStatus::Completed);
    assert_eq!(record.progress_percent, 100);

    let seen = collect_until_finished(&mut events, id).await.unwrap();
    let percents: Vec<u8> = seen
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{percents:?}");
    assert!(matches!(
        seen.last(),
        Some(EngineEvent::Finished { success: true, destination_path: Some(_), .. })
    ));
    assert_eq!(engine.active_count().await, 0);
}

#[tokio::test]
async fn test_unknown_platform_state_keeps_current_status() {
    let dir = TempDir::new().unwrap();
    let (engine, subsystem) = scripted_engine(&dir).await;

    let (id, external_id) = submit_and_wait_for_handle(&engine, "a.zip").await;
    subsystem.set(external_id, PlatformState::Running, 10, 100);
    wait_for_status(&engine, id, |s| s == DownloadStatus::Downloading)
        .await
        .unwrap();

    subsystem.set(external_id, PlatformState::Unknown(64), 20, 100);
    let record = wait_for_record(&engine, id, |r| r.bytes_downloaded == 20)
        .await
        .unwrap();

    assert_eq!(record.status, DownloadStatus::Downloading);
    assert_eq!(record.progress_percent, 20);
}

#[tokio::test]
async fn test_lost_handle_with_file_on_disk_completes() {
    let dir = TempDir::new().unwrap();
    let (engine, subsystem) = scripted_engine(&dir).await;

    let (id, external_id) = submit_and_wait_for_handle(&engine, "song.flac").await;
    std::fs::write(dir.path().join("song.flac"), b"fLaC").unwrap();
    subsystem.lose(external_id);

    let record = wait_for_terminal(&engine, id).await.unwrap();
    assert_eq!(record.status, DownloadStatus::Completed);
}

#[tokio::test]
async fn test_lost_handle_without_file_fails() {
    let dir = TempDir::new().unwrap();
    let (engine, subsystem) = scripted_engine(&dir).await;

    let (id, external_id) = submit_and_wait_for_handle(&engine, "song.flac").await;
    subsystem.lose(external_id);

    let record = wait_for_terminal(&engine, id).await.unwrap();
    assert_eq!(record.status, DownloadStatus::Failed);
    assert_eq!(record.failure_reason.as_deref(), Some(LOST_BY_SUBSYSTEM));
}

#[tokio::test]
async fn test_cancel_sends_cancellation_request() {
    let dir = TempDir::new().unwrap();
    let (engine, subsystem) = scripted_engine(&dir).await;

    let (id, external_id) = submit_and_wait_for_handle(&engine, "big.iso").await;
    assert!(engine.cancel(id).await);

    assert_eq!(subsystem.removed(), vec![external_id]);
    assert!(engine.get(id).await.is_none());
    assert!(engine.list_all().await.is_empty());
}

#[tokio::test]
async fn test_rejected_delegation_fails_record() {
    let dir = TempDir::new().unwrap();
    let (engine, subsystem) = scripted_engine(&dir).await;
    subsystem.reject.store(true, Ordering::SeqCst);
    let mut events = engine.subscribe();

    let id = engine
        .submit("https://pan.example.com/x.bin", "x.bin")
        .await
        .unwrap();
    let seen = collect_until_finished(&mut events, id).await.unwrap();

    assert!(matches!(
        seen.last(),
        Some(EngineEvent::Finished { success: false, .. })
    ));
    let record = wait_for_terminal(&engine, id).await.unwrap();
    assert_eq!(record.status, DownloadStatus::Failed);
    assert!(record.failure_reason.unwrap().contains("storage full"));
}

#[tokio::test]
async fn test_restart_resumes_polling_of_delegated_records() {
    let dir = TempDir::new().unwrap();
    let mut record = DownloadRecord::pending(
        5,
        "resumed.pdf",
        "https://pan.example.com/resumed.pdf",
        dir.path().join("resumed.pdf"),
    );
    record.status = DownloadStatus::Downloading;
    record.external_id = Some(900);
    let raw = serde_json::to_string(&vec![record]).unwrap();
    let backend = Arc::new(MemoryBackend::with_entry(RECORDS_KEY, &raw));
    let subsystem = Arc::new(ScriptedSubsystem::default());
    subsystem.set(900, PlatformState::Successful, 64, 64);

    let engine = DownloadEngine::builder(delegated_config(&dir))
        .store(RecordStore::open(backend).await)
        .external(subsystem.clone())
        .build()
        .await
        .unwrap();

    let record = wait_for_terminal(&engine, 5).await.unwrap();
    assert_eq!(record.status, DownloadStatus::Completed);
    assert_eq!(record.bytes_downloaded, 64);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_background_service_runs_delegated_download() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![9_u8; 4096]))
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let (engine, _) = memory_engine(dir.path(), TransferMode::Delegated).await.unwrap();
    let mut events = engine.subscribe();

    let id = engine
        .submit(&format!("{}/photo.png", server.uri()), "photo.png")
        .await
        .unwrap();
    let seen = collect_until_finished(&mut events, id).await.unwrap();

    assert!(matches!(
        seen.last(),
        Some(EngineEvent::Finished { success: true, .. })
    ));
    let record = engine.get(id).await.unwrap();
    assert_eq!(record.status, DownloadStatus::Completed);
    assert!(record.external_id.is_some());
    assert_eq!(std::fs::read(dir.path().join("photo.png")).unwrap().len(), 4096);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_saved_handles_are_not_reused_by_new_transfers() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![3_u8; 512]))
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let mut stale = DownloadRecord::pending(
        5,
        "stale.iso",
        "https://pan.example.com/stale.iso",
        dir.path().join("stale.iso"),
    );
    stale.status = DownloadStatus::Downloading;
    stale.external_id = Some(1);
    let raw = serde_json::to_string(&vec![stale]).unwrap();
    let backend = Arc::new(MemoryBackend::with_entry(RECORDS_KEY, &raw));

    let engine = DownloadEngine::builder(delegated_config(&dir))
        .store(RecordStore::open(backend).await)
        .build()
        .await
        .unwrap();
    let id = engine
        .submit(&format!("{}/fresh.bin", server.uri()), "fresh.bin")
        .await
        .unwrap();

    let fresh = wait_for_terminal(&engine, id).await.unwrap();
    assert_eq!(fresh.status, DownloadStatus::Completed);
    assert_eq!(fresh.external_id, Some(2));
    let stale = wait_for_terminal(&engine, 5).await.unwrap();
    assert_eq!(stale.status, DownloadStatus::Failed);
    assert_eq!(stale.failure_reason.as_deref(), Some(LOST_BY_SUBSYSTEM));
    assert!(!dir.path().join("stale.iso").exists());
    engine.shutdown().await;
}
