//! Download manager: scheduling, control API, persistence, and events.
//!
//! The [`DownloadManager`] owns every [`TransferRecord`], enforces the
//! concurrency cap, runs one tokio task per active [`FetchWorker`] attempt, and
//! writes the record set through its [`StateStore`] after every add, removal,
//! and status change.
//!
//! # Overview
//!
//! - All record mutations happen under one async lock.
//! - Workers never touch records; they send [`WorkerEvent`]s and a final
//!   [`AttemptOutcome`] to a single coordinator task over an mpsc channel.
//! - A retry sweep re-queues failed transfers that still have budget, gated by
//!   the configured [`RetryPolicy`](crate::download::RetryPolicy).
//! - Subscribers receive [`ManagerEvent`]s over a broadcast channel.
//!
//! # Example
//!
//! ```no_run
//! use download_manager::config::ManagerConfig;
//! use download_manager::manager::DownloadManager;
//! use download_manager::transfer::TransferOptions;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = DownloadManager::new(ManagerConfig::new("./downloads")).await?;
//! let id = manager
//!     .add("https://example.com/file.iso", None, TransferOptions::default())
//!     .await?;
//! manager.wait_until_settled().await;
//! println!("{}", manager.get_info(&id).await?);
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod coordinator;
mod error;
mod events;
mod stats;
mod store;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ManagerConfig;
use crate::download::filename::{filename_from_url, unique_destination};
use crate::download::{
    AttemptOutcome, DownloadError, FetchWorker, HttpClient, WorkerEvent, validate_headers,
    validate_url,
};
use crate::transfer::{TransferId, TransferOptions, TransferRecord, TransferStatus};

use coordinator::WorkerMessage;
pub use error::{ManagerError, StartupError};
pub use events::ManagerEvent;
pub use stats::ManagerStatistics;
pub use store::{JsonFileStore, MemoryStore, StateStore, StoreError};

/// A running attempt, keyed by transfer id in [`ManagerState::active`].
#[derive(Debug)]
struct ActiveAttempt {
    attempt: u64,
    token: CancellationToken,
    /// File the worker writes; busy until the worker reports back.
    destination: PathBuf,
    /// File to delete once the worker has released it.
    delete_on_finish: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct ManagerState {
    records: HashMap<TransferId, TransferRecord>,
    /// Insertion order; drives FIFO scheduling and `list()`.
    order: Vec<TransferId>,
    active: HashMap<TransferId, ActiveAttempt>,
    next_attempt: u64,
    shutting_down: bool,
}

impl ManagerState {
    /// Transfer whose record or still-running worker owns `path`.
    ///
    /// Terminal records only count while their worker is winding down.
    fn destination_owner(&self, path: &Path) -> Option<&TransferId> {
        let live_record = self
            .records
            .values()
            .find(|r| !r.status.is_terminal() && r.destination_path == path)
            .map(|r| &r.id);
        live_record.or_else(|| {
            self.active.iter().find_map(|(id, active)| {
                let busy = active.destination == path
                    || active.delete_on_finish.as_deref() == Some(path);
                busy.then_some(id)
            })
        })
    }

    fn record(&self, id: &TransferId) -> Result<&TransferRecord, ManagerError> {
        self.records
            .get(id)
            .ok_or_else(|| ManagerError::NotFound(id.clone()))
    }

    fn record_mut(&mut self, id: &TransferId) -> Result<&mut TransferRecord, ManagerError> {
        self.records
            .get_mut(id)
            .ok_or_else(|| ManagerError::NotFound(id.clone()))
    }

    fn ordered(&self) -> Vec<TransferRecord> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .cloned()
            .collect()
    }

    fn is_settled(&self) -> bool {
        self.active.is_empty()
            && !self.records.values().any(|record| {
                record.status == TransferStatus::Pending || record.can_auto_retry()
            })
    }
}

struct Inner {
    config: ManagerConfig,
    state: Mutex<ManagerState>,
    store: Arc<dyn StateStore>,
    worker: FetchWorker,
    events: broadcast::Sender<ManagerEvent>,
    messages: mpsc::UnboundedSender<WorkerMessage>,
    /// Parent of every worker token.
    workers_token: CancellationToken,
    /// Stops the coordinator and the retry sweep.
    tasks_token: CancellationToken,
    /// Bumped after every state change; drives the wait helpers.
    changes: watch::Sender<u64>,
}

/// Coordinates concurrent, resumable transfers.
///
/// Dropping the manager cancels every running worker without persisting; call
/// [`shutdown`](Self::shutdown) first to pause active transfers cleanly.
pub struct DownloadManager {
    inner: Arc<Inner>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl DownloadManager {
    /// Creates a manager persisting to the configured JSON state file.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError`] if the configuration is invalid, the state file
    /// cannot be read, or the HTTP client cannot be built.
    pub async fn new(config: ManagerConfig) -> Result<Self, StartupError> {
        let store = Arc::new(JsonFileStore::new(config.resolved_state_path()));
        Self::with_store(config, store).await
    }

    /// Creates a manager over an explicit state store.
    ///
    /// Restored `Downloading` records become `Paused`; restored `Pending`
    /// records are scheduled immediately.
    ///
    /// # Errors
    ///
    /// Returns [`StartupError`] if the configuration is invalid, the store
    /// fails to load, or the HTTP client cannot be built.
    #[instrument(skip(config, store), fields(dir = %config.download_dir.display()))]
    pub async fn with_store(
        config: ManagerConfig,
        store: Arc<dyn StateStore>,
    ) -> Result<Self, StartupError> {
        config.validate()?;

        let client = HttpClient::with_connect_timeout(config.timeout_secs)?;
        let worker = FetchWorker::new(client, config.flush_chunks, config.progress_interval);

        let mut restored = store.load().await?;
        restored.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut state = ManagerState::default();
        for mut record in restored {
            if record.status == TransferStatus::Downloading {
                record.status = TransferStatus::Paused;
            }
            record.clear_rates();
            state.order.push(record.id.clone());
            state.records.insert(record.id.clone(), record);
        }
        info!(restored = state.records.len(), "download manager starting");

        let (events, _) = broadcast::channel(config.event_capacity);
        let (messages, receiver) = mpsc::unbounded_channel();
        let (changes, _) = watch::channel(0);

        let inner = Arc::new(Inner {
            config,
            state: Mutex::new(state),
            store,
            worker,
            events,
            messages,
            workers_token: CancellationToken::new(),
            tasks_token: CancellationToken::new(),
            changes,
        });

        {
            let mut state = inner.state.lock().await;
            inner.fill_slots(&mut state);
            if !state.records.is_empty() {
                inner.persist(&state).await;
            }
        }

        let tasks = vec![
            tokio::spawn(coordinator::run_coordinator(Arc::clone(&inner), receiver)),
            tokio::spawn(coordinator::run_retry_sweep(Arc::clone(&inner))),
        ];

        Ok(Self {
            inner,
            tasks: StdMutex::new(tasks),
        })
    }

    /// The configuration this manager was built with.
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Registers a new transfer and starts it if a slot is free.
    ///
    /// When `destination` is `None` the file name is derived from the URL under
    /// the download directory, with a numeric suffix if another record already
    /// uses that path.
    ///
    /// # Errors
    ///
    /// - [`ManagerError::InvalidUrl`] if the URL is not absolute HTTP(S)
    /// - [`ManagerError::InvalidHeader`] if an extra header cannot be sent
    /// - [`ManagerError::DestinationInUse`] if an unfinished transfer already
    ///   writes to `destination`
    #[instrument(skip(self, options), fields(url = %url))]
    pub async fn add(
        &self,
        url: &str,
        destination: Option<PathBuf>,
        options: TransferOptions,
    ) -> Result<TransferId, ManagerError> {
        let parsed = validate_url(url).map_err(|_| ManagerError::InvalidUrl {
            url: url.to_string(),
        })?;
        validate_headers(&options.headers).map_err(|error| match error {
            DownloadError::InvalidHeader { name } => ManagerError::InvalidHeader { name },
            other => ManagerError::InvalidHeader {
                name: other.to_string(),
            },
        })?;

        let mut state = self.inner.state.lock().await;

        let destination = match destination {
            Some(path) => {
                if let Some(owner) = state.destination_owner(&path) {
                    return Err(ManagerError::DestinationInUse {
                        owner: owner.clone(),
                        path,
                    });
                }
                path
            }
            None => {
                let filename = filename_from_url(&parsed);
                unique_destination(&self.inner.config.download_dir, &filename, |candidate| {
                    state
                        .records
                        .values()
                        .any(|r| r.destination_path == candidate)
                        || state.active.values().any(|a| a.destination == candidate)
                })
            }
        };

        let created_at = Utc::now();
        let mut salt = 0;
        let mut id = TransferId::derive(url, created_at, salt);
        while state.records.contains_key(&id) {
            salt += 1;
            id = TransferId::derive(url, created_at, salt);
        }

        let mut record = TransferRecord::new(id.clone(), url, destination, &options, created_at);
        if options.max_retries.is_none() {
            record.max_retries = self.inner.config.max_retries;
        }
        if options.chunk_size.is_none() {
            record.chunk_size = self.inner.config.chunk_size;
        }
        if options.timeout_secs.is_none() {
            record.timeout_secs = self.inner.config.timeout_secs;
        }
        info!(id = %id, path = %record.destination_path.display(), "transfer added");

        state.order.push(id.clone());
        state.records.insert(id.clone(), record);
        self.inner.emit(ManagerEvent::Added(id.clone()));

        if options.auto_start.unwrap_or(true) {
            self.inner.start_locked(&mut state, &id)?;
        } else {
            self.inner
                .set_status(&mut state, &id, TransferStatus::Paused);
        }

        self.inner.persist(&state).await;
        self.inner.notify();
        Ok(id)
    }

    /// Starts a transfer, or queues it as `Pending` when no slot is free.
    ///
    /// Already `Downloading` or `Completed` transfers are left alone.
    ///
    /// # Errors
    ///
    /// [`ManagerError::NotFound`] for unknown ids, and
    /// [`ManagerError::InvalidState`] for cancelled transfers.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn start(&self, id: &TransferId) -> Result<(), ManagerError> {
        let mut state = self.inner.state.lock().await;
        self.inner.start_locked(&mut state, id)?;
        self.inner.persist(&state).await;
        self.inner.notify();
        Ok(())
    }

    /// Stops a downloading transfer, keeping the partial file for resume.
    ///
    /// # Errors
    ///
    /// [`ManagerError::NotFound`] for unknown ids, and
    /// [`ManagerError::InvalidState`] unless the transfer is `Downloading`.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn pause(&self, id: &TransferId) -> Result<(), ManagerError> {
        let mut state = self.inner.state.lock().await;
        let status = state.record(id)?.status;
        if status != TransferStatus::Downloading {
            return Err(ManagerError::invalid_state(id, status, "pause"));
        }

        if let Some(active) = state.active.get(id) {
            active.token.cancel();
        }
        self.inner.set_status(&mut state, id, TransferStatus::Paused);
        debug!("transfer paused");

        self.inner.persist(&state).await;
        self.inner.notify();
        Ok(())
    }

    /// Restarts a paused or failed transfer.
    ///
    /// Resuming a failed transfer resets its retry count and error.
    ///
    /// # Errors
    ///
    /// [`ManagerError::NotFound`] for unknown ids, and
    /// [`ManagerError::InvalidState`] unless the transfer is `Paused` or `Failed`.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn resume(&self, id: &TransferId) -> Result<(), ManagerError> {
        let mut state = self.inner.state.lock().await;
        let record = state.record_mut(id)?;
        match record.status {
            TransferStatus::Paused => {}
            TransferStatus::Failed => {
                record.retry_count = 0;
                record.last_error = None;
            }
            status => return Err(ManagerError::invalid_state(id, status, "resume")),
        }
        // A manual attempt never spends the automatic retry budget.
        record.auto_retry = false;

        self.inner.start_locked(&mut state, id)?;
        self.inner.persist(&state).await;
        self.inner.notify();
        Ok(())
    }

    /// Cancels a transfer; it will not be scheduled again.
    ///
    /// With `delete_file`, the partial file is removed (after the worker has
    /// stopped, if one is running).
    ///
    /// # Errors
    ///
    /// [`ManagerError::NotFound`] for unknown ids, and
    /// [`ManagerError::InvalidState`] for completed or already cancelled transfers.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn cancel(&self, id: &TransferId, delete_file: bool) -> Result<(), ManagerError> {
        let mut state = self.inner.state.lock().await;
        let record = state.record(id)?;
        if record.status.is_terminal() {
            return Err(ManagerError::invalid_state(id, record.status, "cancel"));
        }
        let path = record.destination_path.clone();

        let deferred = self.inner.stop_worker(&mut state, id, delete_file.then_some(&path));
        if delete_file && !deferred {
            delete_partial(&path).await;
        }

        self.inner
            .set_status(&mut state, id, TransferStatus::Cancelled);
        if let Some(record) = state.records.get_mut(id) {
            record.ended_at = Some(Utc::now());
        }
        info!("transfer cancelled");

        self.inner.persist(&state).await;
        self.inner.notify();
        Ok(())
    }

    /// Forgets a transfer, cancelling it first if it is running.
    ///
    /// With `delete_file`, the file is removed unless the transfer completed.
    ///
    /// # Errors
    ///
    /// [`ManagerError::NotFound`] for unknown ids.
    #[instrument(skip(self), fields(id = %id))]
    pub async fn remove(&self, id: &TransferId, delete_file: bool) -> Result<(), ManagerError> {
        let mut state = self.inner.state.lock().await;
        let record = state.record(id)?;
        let delete = delete_file && record.status != TransferStatus::Completed;
        let path = record.destination_path.clone();

        let deferred = self.inner.stop_worker(&mut state, id, delete.then_some(&path));
        if delete && !deferred {
            delete_partial(&path).await;
        }

        state.records.remove(id);
        state.order.retain(|existing| existing != id);
        info!("transfer removed");
        self.inner.emit(ManagerEvent::Removed(id.clone()));

        self.inner.schedule_next(&mut state);
        self.inner.persist(&state).await;
        self.inner.notify();
        Ok(())
    }

    /// Snapshot of one transfer.
    ///
    /// # Errors
    ///
    /// [`ManagerError::NotFound`] for unknown ids.
    pub async fn get_info(&self, id: &TransferId) -> Result<TransferRecord, ManagerError> {
        let state = self.inner.state.lock().await;
        state.record(id).cloned()
    }

    /// Snapshots of every transfer in insertion order.
    pub async fn list(&self) -> Vec<TransferRecord> {
        self.inner.state.lock().await.ordered()
    }

    /// Aggregate counts and byte totals.
    pub async fn statistics(&self) -> ManagerStatistics {
        let state = self.inner.state.lock().await;
        ManagerStatistics::from_records(state.records.values())
    }

    /// Receives every event published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves once nothing is running, nothing is queued, and no failed
    /// transfer is still eligible for an automatic retry.
    pub async fn wait_until_settled(&self) {
        let mut changes = self.inner.changes.subscribe();
        loop {
            if self.inner.state.lock().await.is_settled() {
                return;
            }
            if changes.changed().await.is_err() {
                return;
            }
        }
    }

    /// Pauses every active transfer and waits for the workers to stop.
    ///
    /// Each worker's final outcome is persisted as it reports. The manager
    /// schedules nothing afterwards.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let mut changes = self.inner.changes.subscribe();
        {
            let mut state = self.inner.state.lock().await;
            state.shutting_down = true;
            let active: Vec<TransferId> = state.active.keys().cloned().collect();
            for id in &active {
                if let Some(attempt) = state.active.get(id) {
                    attempt.token.cancel();
                }
                if state.records.get(id).map(|r| r.status) == Some(TransferStatus::Downloading) {
                    self.inner.set_status(&mut state, id, TransferStatus::Paused);
                }
            }
            info!(active = active.len(), "shutting down");
            if !active.is_empty() {
                self.inner.persist(&state).await;
            }
        }

        loop {
            if self.inner.state.lock().await.active.is_empty() {
                break;
            }
            if changes.changed().await.is_err() {
                break;
            }
        }

        self.inner.tasks_token.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(error) = handle.await {
                warn!(%error, "background task ended abnormally");
            }
        }
        debug!("shutdown complete");
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.inner.workers_token.cancel();
        self.inner.tasks_token.cancel();
    }
}

impl Inner {
    fn emit(&self, event: ManagerEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    async fn persist(&self, state: &ManagerState) {
        if let Err(error) = self.store.save(&state.ordered()).await {
            warn!(%error, "failed to persist download state");
        }
    }

    /// Sets a status, clearing live rates when leaving `Downloading`.
    fn set_status(&self, state: &mut ManagerState, id: &TransferId, status: TransferStatus) {
        let Some(record) = state.records.get_mut(id) else {
            return;
        };
        if record.status == status {
            return;
        }
        record.status = status;
        if status != TransferStatus::Downloading {
            record.clear_rates();
        }
        self.emit(ManagerEvent::StatusChanged {
            id: id.clone(),
            status,
        });
    }

    /// Cancels the running attempt for `id`, if any.
    ///
    /// Returns true when a worker was running; `delete` is then deferred until
    /// it reports back.
    fn stop_worker(
        &self,
        state: &mut ManagerState,
        id: &TransferId,
        delete: Option<&PathBuf>,
    ) -> bool {
        let Some(active) = state.active.get_mut(id) else {
            return false;
        };
        active.token.cancel();
        if let Some(path) = delete {
            active.delete_on_finish = Some(path.clone());
        }
        true
    }

    fn start_locked(
        &self,
        state: &mut ManagerState,
        id: &TransferId,
    ) -> Result<(), ManagerError> {
        let status = state.record(id)?.status;
        match status {
            TransferStatus::Downloading | TransferStatus::Completed => return Ok(()),
            TransferStatus::Cancelled => {
                return Err(ManagerError::invalid_state(id, status, "start"));
            }
            TransferStatus::Pending | TransferStatus::Paused | TransferStatus::Failed => {}
        }

        if self.has_free_slot(state) && !state.active.contains_key(id) {
            self.spawn_attempt(state, id);
        } else {
            debug!(id = %id, active = state.active.len(), "no free slot, queued");
            self.set_status(state, id, TransferStatus::Pending);
        }
        Ok(())
    }

    fn has_free_slot(&self, state: &ManagerState) -> bool {
        !state.shutting_down && state.active.len() < self.config.max_concurrent_downloads
    }

    /// Starts the oldest pending transfer that can run. Returns whether one started.
    fn schedule_next(&self, state: &mut ManagerState) -> bool {
        if !self.has_free_slot(state) {
            return false;
        }
        let next = state
            .order
            .iter()
            .find(|id| {
                !state.active.contains_key(*id)
                    && state.records.get(*id).map(|r| r.status) == Some(TransferStatus::Pending)
            })
            .cloned();
        match next {
            Some(id) => {
                self.spawn_attempt(state, &id);
                true
            }
            None => false,
        }
    }

    /// Starts pending transfers until the cap is reached.
    fn fill_slots(&self, state: &mut ManagerState) {
        while self.schedule_next(state) {}
    }

    fn spawn_attempt(&self, state: &mut ManagerState, id: &TransferId) {
        state.next_attempt += 1;
        let attempt = state.next_attempt;
        let token = self.workers_token.child_token();

        let Some(record) = state.records.get_mut(id) else {
            return;
        };
        record.started_at = Some(Utc::now());
        record.ended_at = None;
        record.last_error = None;
        let snapshot = record.clone();

        state.active.insert(
            id.clone(),
            ActiveAttempt {
                attempt,
                token: token.clone(),
                destination: snapshot.destination_path.clone(),
                delete_on_finish: None,
            },
        );
        self.set_status(state, id, TransferStatus::Downloading);
        self.emit(ManagerEvent::Started(id.clone()));
        debug!(id = %id, attempt, "attempt spawned");

        let worker = self.worker.clone();
        let messages = self.messages.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let report = |event: WorkerEvent| {
                let _ = messages.send(WorkerMessage::event(&id, attempt, event));
            };
            let outcome: AttemptOutcome = worker.run(&snapshot, &token, &report).await;
            let _ = messages.send(WorkerMessage::finished(&id, attempt, outcome));
        });
    }
}

async fn delete_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "deleted file"),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!(path = %path.display(), %error, "failed to delete file"),
    }
}
