//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod socket_guard;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use netdisk_core::engine::EngineEvent;
use netdisk_core::store::{DownloadRecord, DownloadStatus, MemoryBackend};
use netdisk_core::{DownloadEngine, EngineConfig, RecordStore, TransferMode};
use tokio::sync::broadcast;

/// Builds an engine backed by an in-memory key-value store.
pub async fn memory_engine(
    download_dir: &Path,
    mode: TransferMode,
) -> Result<(DownloadEngine, Arc<MemoryBackend>), Box<dyn std::error::Error>> {
    let backend = Arc::new(MemoryBackend::new());
    let store = RecordStore::open(backend.clone()).await;
    let config = EngineConfig {
        download_dir: download_dir.to_path_buf(),
        transfer_mode: mode,
        poll_interval: Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let engine = DownloadEngine::builder(config).store(store).build().await?;
    Ok((engine, backend))
}

/// Waits until the record reaches a terminal state.
pub async fn wait_for_terminal(
    engine: &DownloadEngine,
    id: u64,
) -> Result<DownloadRecord, Box<dyn std::error::Error>> {
    wait_for_status(engine, id, |status| status.is_terminal()).await
}

/// Polls the engine until `accept` returns true for the record's status.
pub async fn wait_for_status(
    engine: &DownloadEngine,
    id: u64,
    accept: impl Fn(DownloadStatus) -> bool,
) -> Result<DownloadRecord, Box<dyn std::error::Error>> {
    wait_for_record(engine, id, |record| accept(record.status)).await
}

/// Polls the engine until `accept` returns true for the record.
pub async fn wait_for_record(
    engine: &DownloadEngine,
    id: u64,
    accept: impl Fn(&DownloadRecord) -> bool,
) -> Result<DownloadRecord, Box<dyn std::error::Error>> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(record) = engine.get(id).await
            && accept(&record)
        {
            return Ok(record);
        }
        if tokio::time::Instant::now() > deadline {
            return Err(format!("download {id} did not reach the expected state").into());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Collects events for `id` until its `Finished` event arrives.
pub async fn collect_until_finished(
    events: &mut broadcast::Receiver<EngineEvent>,
    id: u64,
) -> Result<Vec<EngineEvent>, Box<dyn std::error::Error>> {
    let mut seen = Vec::new();
    let deadline = Duration::from_secs(10);
    loop {
        let event = tokio::time::timeout(deadline, events.recv()).await??;
        if event.download_id() != id {
            continue;
        }
        let finished = matches!(event, EngineEvent::Finished { .. });
        seen.push(event);
        if finished {
            return Ok(seen);
        }
    }
}
