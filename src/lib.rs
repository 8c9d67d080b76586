//! Download Manager Library
//!
//! This library provides a resumable, concurrent HTTP download engine with
//! crash-safe JSON state: transfers survive restarts, resume from partial files
//! with `Range` requests, retry on failure, and verify checksums on completion.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`transfer`] - Transfer records, status lifecycle, checksums
//! - [`download`] - HTTP client and the single-attempt fetch worker
//! - [`manager`] - Scheduling, control API, persistence, and events
//! - [`config`] - Manager configuration and defaults

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod download;
pub mod manager;
pub mod transfer;
mod user_agent;

// Re-export commonly used types
pub use config::{ConfigError, ManagerConfig};
pub use download::{DownloadError, FailureKind, RetryPolicy};
pub use manager::{
    DownloadManager, JsonFileStore, ManagerError, ManagerEvent, ManagerStatistics, MemoryStore,
    StartupError, StateStore, StoreError,
};
pub use transfer::{
    ChecksumAlgorithm, ExpectedChecksum, TransferId, TransferOptions, TransferRecord,
    TransferStatus,
};
