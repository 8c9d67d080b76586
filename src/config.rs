//! Manager configuration with defaults and validation.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::download::RetryPolicy;

/// Default directory for derived destinations.
pub const DEFAULT_DOWNLOAD_DIR: &str = "./downloads";

/// State file name used when no explicit state path is configured.
pub const DEFAULT_STATE_FILE_NAME: &str = "download_state.json";

/// Default number of simultaneously downloading transfers.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

/// Default interval between retry sweeps.
pub const DEFAULT_RETRY_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Default retry budget per transfer.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default streaming chunk size (8 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Default per-request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default number of chunks buffered before a flush.
pub const DEFAULT_FLUSH_CHUNKS: usize = 10;

/// Default interval between progress reports from a worker.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Capacity of the broadcast channel carrying manager events.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

const MIN_CONCURRENCY: usize = 1;
const MAX_CONCURRENCY: usize = 100;

/// Errors raised for configuration that cannot be used.
///
/// These are programmer errors: a manager is never constructed from an
/// invalid configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency { value: usize },

    #[error("retry sweep interval must be greater than zero")]
    ZeroSweepInterval,

    #[error("progress interval must be greater than zero")]
    ZeroProgressInterval,

    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,

    #[error("flush buffer must hold at least one chunk")]
    ZeroFlushChunks,

    #[error("timeout must be greater than zero seconds")]
    ZeroTimeout,

    #[error("event channel capacity must be greater than zero")]
    ZeroEventCapacity,
}

/// Settings for a [`DownloadManager`](crate::DownloadManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Directory that receives files whose destination is derived from the URL.
    pub download_dir: PathBuf,
    /// State file location; `<download_dir>/download_state.json` when unset.
    pub state_path: Option<PathBuf>,
    pub max_concurrent_downloads: usize,
    pub retry_sweep_interval: Duration,
    pub retry_policy: RetryPolicy,
    /// Defaults applied to transfers added without explicit overrides.
    pub max_retries: u32,
    pub chunk_size: usize,
    pub timeout_secs: u64,
    pub flush_chunks: usize,
    pub progress_interval: Duration,
    pub event_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from(DEFAULT_DOWNLOAD_DIR),
            state_path: None,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            retry_sweep_interval: DEFAULT_RETRY_SWEEP_INTERVAL,
            retry_policy: RetryPolicy::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            flush_chunks: DEFAULT_FLUSH_CHUNKS,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ManagerConfig {
    /// Creates a default configuration rooted at `download_dir`.
    #[must_use]
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_max_concurrent_downloads(mut self, value: usize) -> Self {
        self.max_concurrent_downloads = value;
        self
    }

    #[must_use]
    pub fn with_retry_sweep_interval(mut self, interval: Duration) -> Self {
        self.retry_sweep_interval = interval;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    #[must_use]
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    #[must_use]
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Resolved location of the persisted state file.
    #[must_use]
    pub fn resolved_state_path(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| self.download_dir.join(DEFAULT_STATE_FILE_NAME))
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&self.max_concurrent_downloads) {
            return Err(ConfigError::InvalidConcurrency {
                value: self.max_concurrent_downloads,
            });
        }
        if self.retry_sweep_interval.is_zero() {
            return Err(ConfigError::ZeroSweepInterval);
        }
        if self.progress_interval.is_zero() {
            return Err(ConfigError::ZeroProgressInterval);
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.flush_chunks == 0 {
            return Err(ConfigError::ZeroFlushChunks);
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::ZeroEventCapacity);
        }
        Ok(())
    }
}
