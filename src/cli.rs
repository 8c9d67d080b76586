//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use download_manager::ExpectedChecksum;
use download_manager::config::{
    DEFAULT_CHUNK_SIZE, DEFAULT_DOWNLOAD_DIR, DEFAULT_MAX_CONCURRENT_DOWNLOADS,
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_SWEEP_INTERVAL, DEFAULT_TIMEOUT_SECS,
};

/// Resumable, concurrent HTTP downloader.
///
/// Transfers are persisted to a JSON state file in the download directory, so
/// an interrupted run can be picked up again with --resume.
#[derive(Parser, Debug)]
#[command(name = "dlm")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to download
    pub urls: Vec<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Directory downloads are saved to
    #[arg(short = 'o', long = "dir", default_value = DEFAULT_DOWNLOAD_DIR)]
    pub dir: PathBuf,

    /// State file (default: <dir>/download_state.json)
    #[arg(long)]
    pub state: Option<PathBuf>,

    /// Maximum concurrent downloads (1-100)
    #[arg(short = 'c', long, default_value_t = DEFAULT_MAX_CONCURRENT_DOWNLOADS as u8, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: u8,

    /// Maximum automatic retries per transfer (0-10)
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_RETRIES as u8, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: u8,

    /// Seconds between retry sweeps (1-3600)
    #[arg(long, default_value_t = DEFAULT_RETRY_SWEEP_INTERVAL.as_secs(), value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub sweep_interval: u64,

    /// Back off exponentially between retries instead of retrying on every sweep
    #[arg(long)]
    pub exponential_backoff: bool,

    /// Write chunk size in bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE as u64, value_parser = clap::value_parser!(u64).range(1..=16_777_216))]
    pub chunk_size: u64,

    /// Request and read timeout in seconds (1-3600)
    #[arg(short = 't', long, default_value_t = DEFAULT_TIMEOUT_SECS, value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub timeout: u64,

    /// Expected checksum as <algorithm>:<hex> (md5, sha1, sha256); single URL only
    #[arg(long)]
    pub checksum: Option<ExpectedChecksum>,

    /// Extra request header as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// File name to save as, inside the download directory; single URL only
    #[arg(long)]
    pub output_name: Option<String>,

    /// Resume paused and failed transfers restored from the state file
    #[arg(long)]
    pub resume: bool,

    /// Print the persisted transfers and exit
    #[arg(long)]
    pub list: bool,

    /// Disable progress bars
    #[arg(long)]
    pub no_progress: bool,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("header must look like \"Name: value\", got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header name is empty in {raw:?}"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}
