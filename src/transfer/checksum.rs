//! Checksum algorithms and post-download digest verification.
//!
//! Digests are computed on demand after the body has been written, never
//! inline with the streaming path, so throughput is unaffected.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;

const DIGEST_BUF_SIZE: usize = 64 * 1024;

/// Digest algorithm used to verify a finished download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    /// Returns the canonical lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    /// Length of the hex-encoded digest.
    #[must_use]
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha1 => 40,
            Self::Sha256 => 64,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when an `<algorithm>:<hex>` checksum cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseChecksumError {
    #[error("unsupported checksum algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("checksum must have the form <algorithm>:<hex digest>, got {0:?}")]
    Malformed(String),

    #[error("{algorithm} digest must be {expected} hex characters")]
    BadDigest {
        algorithm: ChecksumAlgorithm,
        expected: usize,
    },
}

impl FromStr for ChecksumAlgorithm {
    type Err = ParseChecksumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            _ => Err(ParseChecksumError::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// Expected digest of a transfer's final file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedChecksum {
    pub algorithm: ChecksumAlgorithm,
    pub value: String,
}

impl ExpectedChecksum {
    #[must_use]
    pub fn new(algorithm: ChecksumAlgorithm, value: impl Into<String>) -> Self {
        Self {
            algorithm,
            value: value.into().trim().to_string(),
        }
    }

    /// Case-insensitive comparison against a computed hex digest.
    #[must_use]
    pub fn matches(&self, actual_hex: &str) -> bool {
        self.value.eq_ignore_ascii_case(actual_hex.trim())
    }
}

impl FromStr for ExpectedChecksum {
    type Err = ParseChecksumError;

    /// Parses `<algorithm>:<hex>`, e.g. `sha256:9f86d0...`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, value) = s
            .split_once(':')
            .ok_or_else(|| ParseChecksumError::Malformed(s.to_string()))?;
        let algorithm: ChecksumAlgorithm = algorithm.parse()?;
        let value = value.trim();
        if value.len() != algorithm.hex_len() || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseChecksumError::BadDigest {
                algorithm,
                expected: algorithm.hex_len(),
            });
        }
        Ok(Self::new(algorithm, value))
    }
}

/// Computes the lowercase hex digest of a file.
///
/// Reads in fixed-size blocks so memory stays bounded for large files. This is
/// blocking IO; async callers should run it on the blocking pool.
///
/// # Errors
///
/// Returns the underlying IO error if the file cannot be opened or read.
pub fn file_digest(path: &Path, algorithm: ChecksumAlgorithm) -> io::Result<String> {
    let file = File::open(path)?;
    match algorithm {
        ChecksumAlgorithm::Md5 => digest_reader::<Md5>(file),
        ChecksumAlgorithm::Sha1 => digest_reader::<Sha1>(file),
        ChecksumAlgorithm::Sha256 => digest_reader::<Sha256>(file),
    }
}

fn digest_reader<D: Digest>(mut reader: impl Read) -> io::Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; DIGEST_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
