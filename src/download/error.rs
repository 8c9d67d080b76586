//! Error types for the download module.
//!
//! Every variant carries the URL or path it concerns so the message stored in
//! a record's `last_error` is actionable on its own.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::transfer::ChecksumAlgorithm;

/// Coarse failure classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection, timeout, HTTP error status, or truncated body.
    Network,
    /// Local file create/write/read failure.
    Io,
    /// Downloaded bytes do not match the expected digest.
    Checksum,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Network => "network",
            Self::Io => "io",
            Self::Checksum => "checksum",
        };
        f.write_str(label)
    }
}

/// Errors that can occur during one fetch attempt.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, reset, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// No response or body data within the configured timeout.
    #[error("timeout downloading {url} after {secs}s")]
    Timeout { url: String, secs: u64 },

    /// Non-success HTTP status.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus { url: String, status: u16 },

    /// File system error (create directory/file, write, flush, digest read).
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The URL is malformed or not HTTP(S).
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// A configured extra header is not a valid HTTP header.
    #[error("invalid request header {name:?}")]
    InvalidHeader { name: String },

    /// The stream ended before the announced size was reached.
    #[error("incomplete body from {url}: expected {expected_bytes} bytes, got {actual_bytes}")]
    Incomplete {
        url: String,
        expected_bytes: u64,
        actual_bytes: u64,
    },

    /// A `206` answer to a resume request covers bytes other than the ones asked for.
    #[error("unexpected partial content from {url}: requested offset {requested}, got {received}")]
    RangeMismatch {
        url: String,
        requested: u64,
        received: String,
    },

    /// The finished file does not hash to the expected value.
    #[error("checksum mismatch for {path}: expected {algorithm} {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        algorithm: ChecksumAlgorithm,
        expected: String,
        actual: String,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error, promoting timeouts.
    pub fn network(url: impl Into<String>, source: reqwest::Error, timeout_secs: u64) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout {
                url,
                secs: timeout_secs,
            }
        } else {
            Self::Network { url, source }
        }
    }

    pub fn timeout(url: impl Into<String>, secs: u64) -> Self {
        Self::Timeout {
            url: url.into(),
            secs,
        }
    }

    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    pub fn incomplete(url: impl Into<String>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Incomplete {
            url: url.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// `received_start` is the first byte of the returned `Content-Range`, if any.
    pub fn range_mismatch(
        url: impl Into<String>,
        requested: u64,
        received_start: Option<u64>,
    ) -> Self {
        Self::RangeMismatch {
            url: url.into(),
            requested,
            received: received_start.map_or_else(
                || "no usable Content-Range".to_string(),
                |start| format!("offset {start}"),
            ),
        }
    }

    pub fn checksum_mismatch(
        path: impl Into<PathBuf>,
        algorithm: ChecksumAlgorithm,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::ChecksumMismatch {
            path: path.into(),
            algorithm,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Maps the error onto the caller-facing failure classes.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::HttpStatus { .. }
            | Self::InvalidUrl { .. }
            | Self::InvalidHeader { .. }
            | Self::Incomplete { .. }
            | Self::RangeMismatch { .. } => FailureKind::Network,
            Self::Io { .. } => FailureKind::Io,
            Self::ChecksumMismatch { .. } => FailureKind::Checksum,
        }
    }

    /// Whether the partial file must be discarded before the next attempt.
    ///
    /// True after a digest mismatch, after the server rejected the resume
    /// offset as unsatisfiable, and after it answered with a different range.
    #[must_use]
    pub fn requires_restart(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. }
                | Self::RangeMismatch { .. }
                | Self::HttpStatus { status: 416, .. }
        )
    }
}
