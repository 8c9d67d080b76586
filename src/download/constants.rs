//! Constants for the download module (timeouts, buffering).

/// HTTP connect timeout shared by all transfers (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Idle pooled connections are dropped after this many seconds.
pub const POOL_IDLE_TIMEOUT_SECS: u64 = 90;
