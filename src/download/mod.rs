//! HTTP fetch layer: one resumable attempt per call.
//!
//! This module provides the pieces a single transfer attempt needs, with no
//! knowledge of scheduling or persistence.
//!
//! # Features
//!
//! - Streaming downloads through a buffered writer (memory-bounded)
//! - Resume via `Range: bytes=<n>-`, with fallback when the server ignores it
//! - Cooperative cancellation raced against every network read
//! - Checksum verification (md5/sha1/sha256) on the blocking pool
//! - Structured error types with full context
//! - Retry gating policies for the manager's sweep
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use chrono::Utc;
//! use download_manager::download::{AttemptOutcome, FetchWorker, HttpClient};
//! use download_manager::transfer::{TransferId, TransferOptions, TransferRecord};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let worker = FetchWorker::new(HttpClient::new()?, 10, Duration::from_millis(500));
//! let url = "https://example.com/file.iso";
//! let record = TransferRecord::new(
//!     TransferId::derive(url, Utc::now(), 0),
//!     url,
//!     "./downloads/file.iso".into(),
//!     &TransferOptions::default(),
//!     Utc::now(),
//! );
//! match worker.run(&record, &CancellationToken::new(), &|_| {}).await {
//!     AttemptOutcome::Completed { downloaded, .. } => println!("{downloaded} bytes"),
//!     other => println!("{other:?}"),
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod constants;
mod error;
pub(crate) mod filename;
mod retry;
mod worker;

pub use client::{
    ContentRange, HttpClient, derive_total_size, parse_content_range, validate_headers,
    validate_url,
};
pub use error::{DownloadError, FailureKind};
pub use retry::{RetryDecision, RetryPolicy};
pub use worker::{AttemptOutcome, FetchWorker, WorkerEvent};
