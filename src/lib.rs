//! Netdisk Core Library
//!
//! This library provides the download engine behind the `netdisk` tool: it
//! accepts download requests for links found while browsing a cloud drive,
//! performs (or delegates) the authenticated transfer, tracks every download
//! through a small state machine and keeps a durable history with live
//! progress events.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`db`] - SQLite connection and schema management
//! - [`store`] - Download records and their persisted history
//! - [`auth`] - Cookie jar and per-request credentials
//! - [`transfer`] - In-process streaming fetch with progress sampling
//! - [`external`] - Delegation to an OS-style download service
//! - [`lifecycle`] - Download state transitions
//! - [`engine`] - Orchestration, events and reconciliation
//! - [`config`] - Engine settings and config file parsing

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod config;
pub mod db;
pub mod engine;
pub mod external;
pub mod lifecycle;
pub mod store;
#[cfg(test)]
pub mod test_support;
pub mod transfer;
pub(crate) mod user_agent;

// Re-export commonly used types
pub use auth::{AuthError, Authenticator, Credential, SessionCookies};
pub use config::{EngineConfig, FileConfig, TransferMode};
pub use db::{Database, DbError};
pub use engine::{DownloadEngine, EngineBuilder, EngineError, EngineEvent, media_type_for};
pub use external::{
    BackgroundDownloadService, ExternalAdapter, ExternalError, ExternalStatus, ExternalSubsystem,
    PlatformState,
};
pub use store::{DownloadRecord, DownloadStatus, RecordStore, StoreError};
pub use transfer::{TransferError, TransferExecutor};
