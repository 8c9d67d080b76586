//! Transfer record types and status definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use super::ExpectedChecksum;
use crate::config::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS};

/// Opaque, stable identifier of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    /// Derives an identifier from the URL and the creation instant.
    ///
    /// `salt` is only non-zero when the first candidate collides with an
    /// existing id (two adds of the same URL within one clock tick).
    #[must_use]
    pub fn derive(url: &str, created_at: DateTime<Utc>, salt: u32) -> Self {
        let mut hasher = Md5::new();
        hasher.update(url.as_bytes());
        hasher.update(b"|");
        hasher.update(created_at.to_rfc3339().as_bytes());
        if salt > 0 {
            hasher.update(salt.to_le_bytes());
        }
        let digest = hex::encode(hasher.finalize());
        Self(digest[..16].to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TransferId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TransferId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Waiting for a free concurrency slot.
    Pending,
    /// A fetch worker is streaming the body.
    Downloading,
    /// Stopped by the user (or restored after a crash); partial file kept.
    Paused,
    /// Body fully written and verified.
    Completed,
    /// Last attempt failed; may still be re-queued by the retry sweep.
    Failed,
    /// Abandoned by the user.
    Cancelled,
}

impl TransferStatus {
    /// Returns the persisted string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// `Completed` and `Cancelled` never change again without an explicit
    /// caller action.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid transfer status: {s}")),
        }
    }
}

/// Per-transfer overrides accepted by `DownloadManager::add`.
///
/// Unset fields fall back to the manager defaults.
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    pub max_retries: Option<u32>,
    pub chunk_size: Option<usize>,
    pub timeout_secs: Option<u64>,
    /// Extra request headers sent with every attempt.
    pub headers: BTreeMap<String, String>,
    pub checksum: Option<ExpectedChecksum>,
    /// When `false` the transfer stays `Paused` until explicitly started.
    pub auto_start: Option<bool>,
}

impl TransferOptions {
    #[must_use]
    pub fn with_checksum(mut self, checksum: ExpectedChecksum) -> Self {
        self.checksum = Some(checksum);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

fn default_resumable() -> bool {
    true
}

/// A single managed download.
///
/// Serialized as-is into the state file under `downloads.<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: TransferId,
    pub url: String,
    pub destination_path: PathBuf,
    /// 0 until the first response reveals the size (or forever when the server never does).
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub status: TransferStatus,
    pub speed_bytes_per_sec: f64,
    pub eta_seconds: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub chunk_size: usize,
    pub timeout_secs: u64,
    #[serde(default)]
    pub extra_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub checksum: Option<ExpectedChecksum>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Cleared after a checksum mismatch so the next attempt starts from byte 0.
    #[serde(default = "default_resumable")]
    pub resumable: bool,
    /// Set while the record sits in `Pending` because the retry sweep re-queued it.
    #[serde(default)]
    pub auto_retry: bool,
}

impl TransferRecord {
    /// Creates a pending record, applying `options` over the given defaults.
    #[must_use]
    pub fn new(
        id: TransferId,
        url: impl Into<String>,
        destination_path: PathBuf,
        options: &TransferOptions,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            url: url.into(),
            destination_path,
            total_bytes: 0,
            downloaded_bytes: 0,
            status: TransferStatus::Pending,
            speed_bytes_per_sec: 0.0,
            eta_seconds: 0,
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            chunk_size: options.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE).max(1),
            timeout_secs: options.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
            extra_headers: options.headers.clone(),
            checksum: options.checksum.clone(),
            created_at,
            started_at: None,
            ended_at: None,
            last_error: None,
            resumable: true,
            auto_retry: false,
        }
    }

    /// Fraction complete in `[0, 1]`, or `None` while the size is unknown.
    #[must_use]
    pub fn progress(&self) -> Option<f64> {
        if self.total_bytes == 0 {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        Some((self.downloaded_bytes as f64 / self.total_bytes as f64).min(1.0))
    }

    /// Whether the sweep may still re-queue this record.
    #[must_use]
    pub fn can_auto_retry(&self) -> bool {
        self.status == TransferStatus::Failed && self.retry_count < self.max_retries
    }

    /// Zeroes the live throughput fields once no worker is feeding them.
    pub(crate) fn clear_rates(&mut self) {
        self.speed_bytes_per_sec = 0.0;
        self.eta_seconds = 0;
    }
}

impl fmt::Display for TransferRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transfer {{ id: {}, url: {}, status: {} }}",
            self.id, self.url, self.status
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transfer::ChecksumAlgorithm;

    fn sample_record() -> TransferRecord {
        let created = Utc::now();
        TransferRecord::new(
            TransferId::derive("https://example.com/a.bin", created, 0),
            "https://example.com/a.bin",
            PathBuf::from("downloads/a.bin"),
            &TransferOptions::default(),
            created,
        )
    }

    #[test]
    fn test_transfer_status_round_trips_through_str() {
        for status in [
            TransferStatus::Pending,
            TransferStatus::Downloading,
            TransferStatus::Paused,
            TransferStatus::Completed,
            TransferStatus::Failed,
            TransferStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<TransferStatus>().unwrap(), status);
        }
        assert!("running".parse::<TransferStatus>().is_err());
    }

    #[test]
    fn test_transfer_status_terminal_states() {
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Cancelled.is_terminal());
        assert!(!TransferStatus::Failed.is_terminal());
        assert!(!TransferStatus::Paused.is_terminal());
    }

    #[test]
    fn test_transfer_id_is_stable_and_salted() {
        let created = Utc::now();
        let a = TransferId::derive("https://example.com/x", created, 0);
        let b = TransferId::derive("https://example.com/x", created, 0);
        let c = TransferId::derive("https://example.com/x", created, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn test_new_record_applies_defaults_and_overrides() {
        let record = sample_record();
        assert_eq!(record.status, TransferStatus::Pending);
        assert_eq!(record.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(record.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(record.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert!(record.resumable);

        let options = TransferOptions::default()
            .with_max_retries(7)
            .with_header("Authorization", "Bearer t");
        let created = Utc::now();
        let record = TransferRecord::new(
            TransferId::from("abc"),
            "https://example.com/b",
            PathBuf::from("b"),
            &options,
            created,
        );
        assert_eq!(record.max_retries, 7);
        assert_eq!(
            record.extra_headers.get("Authorization").map(String::as_str),
            Some("Bearer t")
        );
    }

    #[test]
    fn test_progress_unknown_total() {
        let mut record = sample_record();
        assert_eq!(record.progress(), None);
        record.total_bytes = 200;
        record.downloaded_bytes = 50;
        assert_eq!(record.progress(), Some(0.25));
    }

    #[test]
    fn test_status_serializes_as_string_name() {
        let mut record = sample_record();
        record.status = TransferStatus::Downloading;
        record.checksum = Some(ExpectedChecksum::new(ChecksumAlgorithm::Sha1, "ab"));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "downloading");
        assert_eq!(value["checksum"]["algorithm"], "sha1");

        let back: TransferRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_legacy_record_without_optional_fields_deserializes() {
        let json = serde_json::json!({
            "id": "0011223344556677",
            "url": "https://example.com/c",
            "destination_path": "c",
            "total_bytes": 0,
            "downloaded_bytes": 0,
            "status": "paused",
            "speed_bytes_per_sec": 0.0,
            "eta_seconds": 0,
            "retry_count": 0,
            "max_retries": 3,
            "chunk_size": 8192,
            "timeout_secs": 30,
            "created_at": "2024-01-01T00:00:00Z"
        });
        let record: TransferRecord = serde_json::from_value(json).unwrap();
        assert!(record.resumable);
        assert!(!record.auto_retry);
        assert!(record.extra_headers.is_empty());
    }

    #[test]
    fn test_can_auto_retry_respects_budget() {
        let mut record = sample_record();
        record.status = TransferStatus::Failed;
        record.retry_count = 2;
        assert!(record.can_auto_retry());
        record.retry_count = record.max_retries;
        assert!(!record.can_auto_retry());
    }
}
