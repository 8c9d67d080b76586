//! Events broadcast by the manager.

use crate::transfer::{TransferId, TransferStatus};

/// Notification published on the manager's broadcast channel.
///
/// Subscribers that fall behind lose the oldest events
/// (`RecvError::Lagged`); current state is always available via
/// [`DownloadManager::get_info`](super::DownloadManager::get_info).
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    Added(TransferId),
    Started(TransferId),
    Progress {
        id: TransferId,
        downloaded: u64,
        total: u64,
        speed_bytes_per_sec: f64,
    },
    StatusChanged {
        id: TransferId,
        status: TransferStatus,
    },
    Completed(TransferId),
    Failed {
        id: TransferId,
        message: String,
    },
    Removed(TransferId),
}

impl ManagerEvent {
    /// The transfer this event concerns.
    #[must_use]
    pub fn id(&self) -> &TransferId {
        match self {
            Self::Added(id)
            | Self::Started(id)
            | Self::Completed(id)
            | Self::Removed(id)
            | Self::Progress { id, .. }
            | Self::StatusChanged { id, .. }
            | Self::Failed { id, .. } => id,
        }
    }
}
