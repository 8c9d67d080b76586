//! Progress UI (one bar per transfer) driven by manager events.

use std::collections::HashMap;
use std::sync::Arc;

use download_manager::{DownloadManager, ManagerEvent, TransferId, TransferStatus};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Spawns the progress UI when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
/// When `enabled` is false, returns (None, stop) with stop already cancelled.
pub(crate) fn spawn_progress_ui(
    enabled: bool,
    manager: Arc<DownloadManager>,
) -> (Option<tokio::task::JoinHandle<()>>, CancellationToken) {
    let stop = CancellationToken::new();
    if !enabled {
        stop.cancel();
        return (None, stop);
    }
    let handle = tokio::spawn(run_progress_ui(manager, stop.clone()));
    (Some(handle), stop)
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{prefix:24!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ")
}

struct Bars {
    multi: MultiProgress,
    bars: HashMap<TransferId, ProgressBar>,
}

impl Bars {
    async fn get(&mut self, manager: &DownloadManager, id: &TransferId) -> Option<ProgressBar> {
        if let Some(bar) = self.bars.get(id) {
            return Some(bar.clone());
        }
        let record = manager.get_info(id).await.ok()?;
        let name = record
            .destination_path
            .file_name()
            .map_or_else(|| record.url.clone(), |n| n.to_string_lossy().into_owned());

        let bar = self.multi.add(ProgressBar::new(record.total_bytes));
        bar.set_style(bar_style());
        bar.set_prefix(name);
        bar.set_position(record.downloaded_bytes);
        self.bars.insert(id.clone(), bar.clone());
        Some(bar)
    }
}

async fn run_progress_ui(manager: Arc<DownloadManager>, stop: CancellationToken) {
    let mut events = manager.subscribe();
    let mut bars = Bars {
        multi: MultiProgress::new(),
        bars: HashMap::new(),
    };

    for record in manager.list().await {
        if matches!(
            record.status,
            TransferStatus::Downloading | TransferStatus::Pending
        ) {
            bars.get(&manager, &record.id).await;
        }
    }

    loop {
        let event = tokio::select! {
            () = stop.cancelled() => break,
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };

        match event {
            ManagerEvent::Added(id) | ManagerEvent::Started(id) => {
                if let Some(bar) = bars.get(&manager, &id).await {
                    bar.set_message("");
                }
            }
            ManagerEvent::Progress {
                id,
                downloaded,
                total,
                speed_bytes_per_sec,
            } => {
                if let Some(bar) = bars.get(&manager, &id).await {
                    if total > 0 {
                        bar.set_length(total);
                    }
                    bar.set_position(downloaded);
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let speed = HumanBytes(speed_bytes_per_sec as u64);
                    bar.set_message(format!("{speed}/s"));
                }
            }
            ManagerEvent::StatusChanged { id, status } => {
                if let Some(bar) = bars.bars.get(&id) {
                    match status {
                        TransferStatus::Pending => bar.set_message("queued"),
                        TransferStatus::Paused => bar.set_message("paused"),
                        TransferStatus::Cancelled => bar.abandon_with_message("cancelled"),
                        _ => {}
                    }
                }
            }
            ManagerEvent::Completed(id) => {
                if let Some(bar) = bars.bars.get(&id) {
                    if let Some(total) = bar.length() {
                        bar.set_position(total);
                    }
                    bar.finish_with_message("done");
                }
            }
            ManagerEvent::Failed { id, message } => {
                if let Some(bar) = bars.bars.get(&id) {
                    bar.set_message(format!("failed: {message}"));
                }
            }
            ManagerEvent::Removed(id) => {
                if let Some(bar) = bars.bars.remove(&id) {
                    bar.finish_and_clear();
                }
            }
        }
    }

    for bar in bars.bars.values() {
        if !bar.is_finished() {
            bar.abandon();
        }
    }
}
