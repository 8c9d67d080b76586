//! Transfer records: the durable description and live progress of one download.
//!
//! # Overview
//!
//! - [`TransferRecord`] - identity, destination, progress and lifecycle timestamps
//! - [`TransferStatus`] - lifecycle states (pending → downloading → completed/failed/...)
//! - [`TransferOptions`] - per-transfer overrides supplied at add time
//! - [`ExpectedChecksum`] - optional integrity check applied after the body is written
//!
//! Records carry no behavior of their own. The manager owns and mutates them;
//! callers only ever see cloned snapshots.

mod checksum;
mod record;

pub use checksum::{ChecksumAlgorithm, ExpectedChecksum, ParseChecksumError, file_digest};
pub use record::{TransferId, TransferOptions, TransferRecord, TransferStatus};
