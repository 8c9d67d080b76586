//! Single-attempt fetch worker.
//!
//! A [`FetchWorker`] performs exactly one attempt for a transfer: it issues the
//! GET (resuming with `Range` when a partial file exists), streams the body to
//! disk through a buffered writer, reports throughput on a timer, verifies the
//! checksum, and returns an [`AttemptOutcome`]. It never touches manager state;
//! everything flows back through the `report` callback and the return value.

use std::path::Path;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::{Response, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::{HttpClient, derive_total_size, response_content_range};
use super::error::DownloadError;
use crate::transfer::{TransferRecord, file_digest};

/// Notifications emitted while an attempt runs.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The response headers were accepted and writing is about to begin.
    Started {
        downloaded: u64,
        total: u64,
        /// False when the attempt (re)starts from byte 0.
        resumed: bool,
    },
    /// Periodic throughput sample, emitted after each flush interval.
    ///
    /// `speed_bytes_per_sec` is `downloaded / elapsed`, where `elapsed` runs
    /// from the start of this attempt and `downloaded` includes resumed bytes.
    /// `eta_seconds` is `(total - downloaded) / speed`, or 0 when either is unknown.
    Progress {
        downloaded: u64,
        total: u64,
        speed_bytes_per_sec: f64,
        eta_seconds: u64,
    },
}

/// Terminal result of one attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    Completed { downloaded: u64, total: u64 },
    Failed {
        error: DownloadError,
        downloaded: u64,
        total: u64,
    },
    Cancelled { downloaded: u64, total: u64 },
}

impl AttemptOutcome {
    /// Bytes on disk when the attempt ended.
    #[must_use]
    pub fn downloaded(&self) -> u64 {
        match self {
            Self::Completed { downloaded, .. }
            | Self::Failed { downloaded, .. }
            | Self::Cancelled { downloaded, .. } => *downloaded,
        }
    }

    /// Best known total size when the attempt ended (0 = unknown).
    #[must_use]
    pub fn total(&self) -> u64 {
        match self {
            Self::Completed { total, .. }
            | Self::Failed { total, .. }
            | Self::Cancelled { total, .. } => *total,
        }
    }
}

/// Byte counters shared between the attempt body and the outcome mapping.
#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    downloaded: u64,
    total: u64,
}

enum Flow {
    Finished,
    Cancelled,
}

/// Executes fetch attempts with shared buffering and reporting settings.
#[derive(Debug, Clone)]
pub struct FetchWorker {
    client: HttpClient,
    flush_chunks: usize,
    progress_interval: Duration,
}

impl FetchWorker {
    /// Creates a worker.
    ///
    /// `flush_chunks` is how many `chunk_size` pieces are buffered before the
    /// writer spills to disk; `progress_interval` is the minimum time between
    /// progress samples.
    #[must_use]
    pub fn new(client: HttpClient, flush_chunks: usize, progress_interval: Duration) -> Self {
        Self {
            client,
            flush_chunks: flush_chunks.max(1),
            progress_interval,
        }
    }

    /// Runs one attempt for `record`.
    ///
    /// Never panics on expected failures; transport, disk, and integrity
    /// problems come back as [`AttemptOutcome::Failed`]. Cancellation via
    /// `token` flushes what was received and yields [`AttemptOutcome::Cancelled`].
    #[instrument(skip(self, record, token, report), fields(id = %record.id, url = %record.url))]
    pub async fn run(
        &self,
        record: &TransferRecord,
        token: &CancellationToken,
        report: &(dyn Fn(WorkerEvent) + Send + Sync),
    ) -> AttemptOutcome {
        let mut tally = Tally {
            downloaded: record.downloaded_bytes,
            total: record.total_bytes,
        };

        match self.attempt(record, token, report, &mut tally).await {
            Ok(Flow::Finished) => {
                info!(bytes = tally.downloaded, "transfer complete");
                AttemptOutcome::Completed {
                    downloaded: tally.downloaded,
                    total: tally.total,
                }
            }
            Ok(Flow::Cancelled) => {
                debug!(bytes = tally.downloaded, "attempt cancelled");
                AttemptOutcome::Cancelled {
                    downloaded: tally.downloaded,
                    total: tally.total,
                }
            }
            Err(error) => {
                warn!(error = %error, bytes = tally.downloaded, "attempt failed");
                AttemptOutcome::Failed {
                    error,
                    downloaded: tally.downloaded,
                    total: tally.total,
                }
            }
        }
    }

    async fn attempt(
        &self,
        record: &TransferRecord,
        token: &CancellationToken,
        report: &(dyn Fn(WorkerEvent) + Send + Sync),
        tally: &mut Tally,
    ) -> Result<Flow, DownloadError> {
        if token.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        let attempt_start = Instant::now();

        let path = record.destination_path.as_path();
        let existing = if record.resumable {
            existing_size(path).await
        } else {
            0
        };
        tally.downloaded = existing;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent, e))?;
        }

        let timeout = Duration::from_secs(record.timeout_secs.max(1));
        let range_start = (existing > 0).then_some(existing);
        let response = tokio::select! {
            biased;
            () = token.cancelled() => return Ok(Flow::Cancelled),
            result = self.client.get(&record.url, &record.extra_headers, range_start, timeout) => result?,
        };

        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return finish_unsatisfiable(record, &response, existing, tally).await;
        }

        let resumed = match resume_offset(&response, existing) {
            ResumeOffset::Requested => true,
            ResumeOffset::FromZero => {
                if existing > 0 {
                    debug!(
                        status = response.status().as_u16(),
                        "server ignored range request, restarting from zero"
                    );
                }
                false
            }
            ResumeOffset::Other(received) => {
                return Err(DownloadError::range_mismatch(
                    &record.url,
                    existing,
                    received,
                ));
            }
        };
        let start = if resumed { existing } else { 0 };
        tally.downloaded = start;
        tally.total = derive_total_size(&response, start, resumed);

        let file = open_destination(path, resumed).await?;
        let capacity = record.chunk_size.saturating_mul(self.flush_chunks);
        let mut writer = BufWriter::with_capacity(capacity, file);

        report(WorkerEvent::Started {
            downloaded: tally.downloaded,
            total: tally.total,
            resumed,
        });

        let streamed = self
            .stream_body(record, response, &mut writer, token, report, tally, attempt_start)
            .await;
        let flushed = writer
            .flush()
            .await
            .map_err(|e| DownloadError::io(path, e));

        match streamed {
            Ok(Flow::Cancelled) => {
                flushed?;
                return Ok(Flow::Cancelled);
            }
            Ok(Flow::Finished) => flushed?,
            Err(error) => {
                if let Err(flush_error) = flushed {
                    debug!(error = %flush_error, "flush after failed stream also failed");
                }
                return Err(error);
            }
        }

        if tally.total > 0 && tally.downloaded != tally.total {
            return Err(DownloadError::incomplete(
                &record.url,
                tally.total,
                tally.downloaded,
            ));
        }
        if tally.total == 0 {
            tally.total = tally.downloaded;
        }

        verify_checksum(record).await?;
        Ok(Flow::Finished)
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_body(
        &self,
        record: &TransferRecord,
        response: Response,
        writer: &mut BufWriter<File>,
        token: &CancellationToken,
        report: &(dyn Fn(WorkerEvent) + Send + Sync),
        tally: &mut Tally,
        attempt_start: Instant,
    ) -> Result<Flow, DownloadError> {
        let path = record.destination_path.as_path();
        let read_timeout = Duration::from_secs(record.timeout_secs.max(1));
        let chunk_size = record.chunk_size.max(1);

        let mut last_report = Instant::now();
        let mut stream = response.bytes_stream();

        loop {
            let next = tokio::select! {
                biased;
                () = token.cancelled() => return Ok(Flow::Cancelled),
                next = tokio::time::timeout(read_timeout, stream.next()) => next,
            };
            let bytes = match next {
                Err(_) => {
                    return Err(DownloadError::timeout(&record.url, read_timeout.as_secs()));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    return Err(DownloadError::network(
                        &record.url,
                        e,
                        read_timeout.as_secs(),
                    ));
                }
                Ok(Some(Ok(bytes))) => bytes,
            };

            for piece in bytes.chunks(chunk_size) {
                if token.is_cancelled() {
                    return Ok(Flow::Cancelled);
                }
                writer
                    .write_all(piece)
                    .await
                    .map_err(|e| DownloadError::io(path, e))?;
                tally.downloaded += piece.len() as u64;
            }

            if last_report.elapsed() >= self.progress_interval {
                writer
                    .flush()
                    .await
                    .map_err(|e| DownloadError::io(path, e))?;
                let speed = throughput(tally.downloaded, attempt_start.elapsed());
                report(WorkerEvent::Progress {
                    downloaded: tally.downloaded,
                    total: tally.total,
                    speed_bytes_per_sec: speed,
                    eta_seconds: eta_seconds(tally.total, tally.downloaded, speed),
                });
                last_report = Instant::now();
            }
        }

        Ok(Flow::Finished)
    }
}

/// Where a response body starts relative to the partial file.
enum ResumeOffset {
    /// Continues exactly at the partial file's end.
    Requested,
    /// Carries the whole body from byte 0.
    FromZero,
    /// Starts elsewhere, or the start cannot be determined.
    Other(Option<u64>),
}

fn resume_offset(response: &Response, existing: u64) -> ResumeOffset {
    if response.status() != StatusCode::PARTIAL_CONTENT {
        return ResumeOffset::FromZero;
    }
    let start = response_content_range(response)
        .and_then(|cr| cr.range)
        .map(|(start, _)| start);
    match start {
        Some(start) if existing > 0 && start == existing => ResumeOffset::Requested,
        Some(0) => ResumeOffset::FromZero,
        other => ResumeOffset::Other(other),
    }
}

/// Handles a `416` answer to a resume request.
///
/// The server reports the full length as `bytes */N`; if the partial file is
/// already that long the transfer is complete.
async fn finish_unsatisfiable(
    record: &TransferRecord,
    response: &Response,
    existing: u64,
    tally: &mut Tally,
) -> Result<Flow, DownloadError> {
    let total = response_content_range(response).and_then(|cr| cr.total);
    if total != Some(existing) {
        return Err(DownloadError::http_status(
            &record.url,
            StatusCode::RANGE_NOT_SATISFIABLE.as_u16(),
        ));
    }

    debug!(bytes = existing, "partial file already complete");
    tally.downloaded = existing;
    tally.total = existing;
    verify_checksum(record).await?;
    Ok(Flow::Finished)
}

async fn existing_size(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|m| if m.is_file() { m.len() } else { 0 })
        .unwrap_or(0)
}

async fn open_destination(path: &Path, append: bool) -> Result<File, DownloadError> {
    let mut options = OpenOptions::new();
    if append {
        options.append(true);
    } else {
        options.write(true).create(true).truncate(true);
    }
    options
        .open(path)
        .await
        .map_err(|e| DownloadError::io(path, e))
}

async fn verify_checksum(record: &TransferRecord) -> Result<(), DownloadError> {
    let Some(expected) = record.checksum.clone() else {
        return Ok(());
    };

    let path = record.destination_path.clone();
    let algorithm = expected.algorithm;
    let actual = tokio::task::spawn_blocking(move || file_digest(&path, algorithm))
        .await
        .map_err(|e| DownloadError::io(&record.destination_path, std::io::Error::other(e)))?
        .map_err(|e| DownloadError::io(&record.destination_path, e))?;

    if expected.matches(&actual) {
        debug!(algorithm = %algorithm, "checksum verified");
        Ok(())
    } else {
        Err(DownloadError::checksum_mismatch(
            &record.destination_path,
            algorithm,
            expected.value,
            actual,
        ))
    }
}

#[allow(clippy::cast_precision_loss)]
fn throughput(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 { 0.0 } else { bytes as f64 / secs }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn eta_seconds(total: u64, downloaded: u64, speed: f64) -> u64 {
    if total == 0 || speed <= 0.0 || downloaded >= total {
        return 0;
    }
    ((total - downloaded) as f64 / speed).ceil() as u64
}
