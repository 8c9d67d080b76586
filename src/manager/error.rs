//! Error types returned by manager operations.

use std::path::PathBuf;

use thiserror::Error;

use super::store::StoreError;
use crate::config::ConfigError;
use crate::transfer::{TransferId, TransferStatus};

/// Rejected control operation.
///
/// Returned for unknown ids and invalid transitions; the manager's state is
/// left untouched whenever one of these is produced.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("no transfer with id {0}")]
    NotFound(TransferId),

    #[error("cannot {operation} transfer {id} while it is {status}")]
    InvalidState {
        id: TransferId,
        status: TransferStatus,
        operation: &'static str,
    },

    #[error("destination {} is already used by transfer {owner}", path.display())]
    DestinationInUse { path: PathBuf, owner: TransferId },

    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    #[error("invalid request header {name:?}")]
    InvalidHeader { name: String },
}

impl ManagerError {
    pub(crate) fn invalid_state(
        id: &TransferId,
        status: TransferStatus,
        operation: &'static str,
    ) -> Self {
        Self::InvalidState {
            id: id.clone(),
            status,
            operation,
        }
    }
}

/// Failure while constructing a [`DownloadManager`](super::DownloadManager).
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to restore state: {0}")]
    Store(#[from] StoreError),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
