//! Durable state for the manager.
//!
//! The manager writes its full record set through a [`StateStore`] after every
//! add, removal, and status change. [`JsonFileStore`] is the production
//! implementation; [`MemoryStore`] keeps state in-process for tests and
//! embedding.
//!
//! On-disk format:
//!
//! ```json
//! { "downloads": { "<id>": { "id": "<id>", "url": "...", "status": "paused", ... } } }
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::transfer::TransferRecord;

/// Errors raised while reading or writing persisted state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Persistence seam used by the manager.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads every persisted record. Missing state is an empty set.
    async fn load(&self) -> Result<Vec<TransferRecord>, StoreError>;

    /// Replaces the persisted state with `records`.
    async fn save(&self, records: &[TransferRecord]) -> Result<(), StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    downloads: BTreeMap<String, TransferRecord>,
}

/// JSON state file written atomically (temp file + rename).
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Moves an unreadable state file aside so the next save does not clobber it.
    async fn quarantine(&self) -> Option<PathBuf> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(format!(".corrupt-{stamp}"));
        let target = self.path.with_file_name(name);
        match tokio::fs::rename(&self.path, &target).await {
            Ok(()) => Some(target),
            Err(error) => {
                warn!(path = %self.path.display(), %error, "could not move corrupt state file aside");
                None
            }
        }
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    async fn load(&self) -> Result<Vec<TransferRecord>, StoreError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!("no state file, starting empty");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        match serde_json::from_slice::<StateFile>(&raw) {
            Ok(state) => {
                debug!(count = state.downloads.len(), "state restored");
                Ok(state.downloads.into_values().collect())
            }
            Err(error) => {
                let moved_to = self.quarantine().await;
                warn!(
                    %error,
                    moved_to = ?moved_to,
                    "state file is corrupt, starting empty"
                );
                Ok(Vec::new())
            }
        }
    }

    #[instrument(level = "debug", skip(self, records), fields(path = %self.path.display(), count = records.len()))]
    async fn save(&self, records: &[TransferRecord]) -> Result<(), StoreError> {
        let state = StateFile {
            downloads: records
                .iter()
                .map(|record| (record.id.to_string(), record.clone()))
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&state).map_err(StoreError::Serialize)?;

        let write_error = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(write_error)?;
        }
        let temp = self.temp_path();
        tokio::fs::write(&temp, &json).await.map_err(write_error)?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(write_error)?;
        Ok(())
    }
}

/// In-process store; `save` replaces the held snapshot.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<TransferRecord>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store, as if a previous run had saved `records`.
    #[must_use]
    pub fn with_records(records: Vec<TransferRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    /// Snapshot of the last saved state.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TransferRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<Vec<TransferRecord>, StoreError> {
        Ok(self.snapshot())
    }

    async fn save(&self, records: &[TransferRecord]) -> Result<(), StoreError> {
        let mut held = self
            .records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *held = records.to_vec();
        Ok(())
    }
}
