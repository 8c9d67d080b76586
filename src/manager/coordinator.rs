//! Background tasks: worker message handling and the retry sweep.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Inner, ManagerEvent, ManagerState, delete_partial};
use crate::download::{AttemptOutcome, RetryDecision, WorkerEvent};
use crate::transfer::{TransferId, TransferStatus};

/// Message from a worker task to the coordinator.
#[derive(Debug)]
pub(super) struct WorkerMessage {
    id: TransferId,
    attempt: u64,
    kind: MessageKind,
}

#[derive(Debug)]
enum MessageKind {
    Event(WorkerEvent),
    Finished(AttemptOutcome),
}

impl WorkerMessage {
    pub(super) fn event(id: &TransferId, attempt: u64, event: WorkerEvent) -> Self {
        Self {
            id: id.clone(),
            attempt,
            kind: MessageKind::Event(event),
        }
    }

    pub(super) fn finished(id: &TransferId, attempt: u64, outcome: AttemptOutcome) -> Self {
        Self {
            id: id.clone(),
            attempt,
            kind: MessageKind::Finished(outcome),
        }
    }
}

/// Applies worker messages to manager state until the manager stops.
pub(super) async fn run_coordinator(
    inner: Arc<Inner>,
    mut receiver: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    loop {
        let message = tokio::select! {
            () = inner.tasks_token.cancelled() => break,
            message = receiver.recv() => message,
        };
        let Some(message) = message else {
            break;
        };
        inner.handle_message(message).await;
    }
    debug!("coordinator stopped");
}

/// Periodically re-queues failed transfers that still have retry budget.
pub(super) async fn run_retry_sweep(inner: Arc<Inner>) {
    let mut interval = tokio::time::interval(inner.config.retry_sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = inner.tasks_token.cancelled() => break,
            _ = interval.tick() => inner.sweep().await,
        }
    }
    debug!("retry sweep stopped");
}

impl Inner {
    async fn handle_message(&self, message: WorkerMessage) {
        let mut state = self.state.lock().await;
        let current = state
            .active
            .get(&message.id)
            .is_some_and(|active| active.attempt == message.attempt);
        if !current {
            debug!(id = %message.id, attempt = message.attempt, "stale worker message ignored");
            return;
        }

        match message.kind {
            MessageKind::Event(event) => self.apply_worker_event(&mut state, &message.id, event),
            MessageKind::Finished(outcome) => {
                self.apply_outcome(&mut state, &message.id, outcome).await;
            }
        }
    }

    fn apply_worker_event(&self, state: &mut ManagerState, id: &TransferId, event: WorkerEvent) {
        let Some(record) = state.records.get_mut(id) else {
            return;
        };
        if record.status != TransferStatus::Downloading {
            return;
        }

        match event {
            WorkerEvent::Started {
                downloaded,
                total,
                resumed,
            } => {
                record.downloaded_bytes = downloaded;
                record.total_bytes = total;
                if !resumed {
                    // Bytes now on disk belong to this attempt.
                    record.resumable = true;
                }
                debug!(id = %id, downloaded, total, resumed, "attempt streaming");
            }
            WorkerEvent::Progress {
                downloaded,
                total,
                speed_bytes_per_sec,
                eta_seconds,
            } => {
                record.downloaded_bytes = downloaded;
                record.total_bytes = total;
                record.speed_bytes_per_sec = speed_bytes_per_sec;
                record.eta_seconds = eta_seconds;
            }
        }

        let event = ManagerEvent::Progress {
            id: id.clone(),
            downloaded: record.downloaded_bytes,
            total: record.total_bytes,
            speed_bytes_per_sec: record.speed_bytes_per_sec,
        };
        self.emit(event);
        self.notify();
    }

    async fn apply_outcome(
        &self,
        state: &mut ManagerState,
        id: &TransferId,
        outcome: AttemptOutcome,
    ) {
        let Some(active) = state.active.remove(id) else {
            return;
        };

        if let Some(record) = state.records.get_mut(id) {
            record.downloaded_bytes = outcome.downloaded();
            if outcome.total() > 0 {
                record.total_bytes = outcome.total();
            }
            record.clear_rates();
        }
        let status = state.records.get(id).map(|record| record.status);

        match outcome {
            AttemptOutcome::Completed { .. }
                if matches!(
                    status,
                    Some(
                        TransferStatus::Downloading
                            | TransferStatus::Paused
                            | TransferStatus::Pending
                    )
                ) =>
            {
                self.set_status(state, id, TransferStatus::Completed);
                if let Some(record) = state.records.get_mut(id) {
                    if record.total_bytes > 0 {
                        record.downloaded_bytes = record.total_bytes;
                    }
                    record.ended_at = Some(Utc::now());
                    record.last_error = None;
                    record.auto_retry = false;
                    info!(id = %id, bytes = record.downloaded_bytes, "transfer completed");
                }
                self.emit(ManagerEvent::Completed(id.clone()));
            }
            AttemptOutcome::Failed { error, .. } if status == Some(TransferStatus::Downloading) => {
                let message = error.to_string();
                if let Some(record) = state.records.get_mut(id) {
                    if record.auto_retry {
                        record.retry_count += 1;
                        record.auto_retry = false;
                    }
                    if error.requires_restart() {
                        record.resumable = false;
                    }
                    record.last_error = Some(message.clone());
                    record.ended_at = Some(Utc::now());
                    warn!(
                        id = %id,
                        kind = %error.kind(),
                        retry_count = record.retry_count,
                        max_retries = record.max_retries,
                        error = %message,
                        "transfer failed"
                    );
                }
                self.set_status(state, id, TransferStatus::Failed);
                self.emit(ManagerEvent::Failed {
                    id: id.clone(),
                    message,
                });
            }
            AttemptOutcome::Cancelled { .. } if status == Some(TransferStatus::Downloading) => {
                self.set_status(state, id, TransferStatus::Paused);
            }
            _ => {
                debug!(id = %id, ?status, "attempt ended after status change");
            }
        }

        if let Some(path) = active.delete_on_finish {
            delete_partial(&path).await;
        }

        self.schedule_next(state);
        self.persist(state).await;
        self.notify();
    }

    async fn sweep(&self) {
        let mut state = self.state.lock().await;
        if state.shutting_down {
            return;
        }

        let now = Utc::now();
        let mut requeued = Vec::new();
        for id in &state.order {
            let Some(record) = state.records.get(id) else {
                continue;
            };
            if record.status != TransferStatus::Failed || state.active.contains_key(id) {
                continue;
            }
            let since_failure = record
                .ended_at
                .and_then(|ended| (now - ended).to_std().ok())
                .unwrap_or_default();
            match self.config.retry_policy.should_retry(
                record.retry_count,
                record.max_retries,
                since_failure,
            ) {
                RetryDecision::Retry => requeued.push(id.clone()),
                RetryDecision::Wait { remaining } => {
                    debug!(id = %id, ?remaining, "retry backoff pending");
                }
                RetryDecision::DoNotRetry { .. } => {}
            }
        }

        if requeued.is_empty() {
            return;
        }

        for id in &requeued {
            if let Some(record) = state.records.get_mut(id) {
                record.auto_retry = true;
                record.last_error = None;
                debug!(id = %id, retry_count = record.retry_count, "re-queued for retry");
            }
            self.set_status(&mut state, id, TransferStatus::Pending);
        }

        self.fill_slots(&mut state);
        self.persist(&state).await;
        self.notify();
    }
}
