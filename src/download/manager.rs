// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download manager: the registry state machine.
//!
//! A single worker task owns the item list. Public commands and transfer
//! callbacks are both delivered to it through one FIFO channel, so every
//! mutation is applied in order by one writer. Reads are served from the
//! last published [`Snapshot`] and never wait on the worker.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tokio::fs;
use tokio::sync::{mpsc, oneshot, watch};

use super::engine::{
    partial_path, TransferEngine, TransferEvent, TransferEventKind, TransferHandle,
    TransferRequest, TransferSerial, TransferSink,
};
use super::http::HttpTransferEngine;
use super::observer::{Snapshot, SnapshotHub, SnapshotStream, Subscription};
use super::state::{DownloadStore, JsonFileStore};
use super::types::{DownloadItem, DownloadRequest, DownloadStatus, StatusCounts};
use crate::config::{Config, ResumeMode};

/// Commands that can be sent to the download worker.
#[derive(Debug, Clone)]
pub enum DownloadCommand {
    /// Start (or force-restart) a download
    Start(DownloadRequest),
    /// Pause a running download
    Pause { id: String },
    /// Resume a paused download
    Resume { id: String },
    /// Restart a failed download
    Retry { id: String },
    /// Cancel and forget a download, deleting its file
    Delete { id: String },
    /// Forget everything and empty the download directory
    ClearAll,
    /// Pause every running transfer, persist, and stop the worker
    Shutdown,
    /// Does nothing; acknowledges once everything queued before it ran
    Sync,
}

enum Message {
    Command(DownloadCommand, oneshot::Sender<()>),
    Transfer(TransferEvent),
}

/// Bytes kept verbatim in file names; everything else, `%` included, is
/// percent-encoded so distinct ids never share a path.
const FILE_NAME_ESCAPES: &AsciiSet = &NON_ALPHANUMERIC.remove(b'.').remove(b'-').remove(b'_');

/// File name for an item: the percent-encoded id plus the configured
/// extension. A leading `.` is encoded too, so no id yields a hidden file
/// or a `..` path component.
pub fn local_path_for(download_dir: &Path, id: &str, extension: &str) -> PathBuf {
    let mut name = match id.strip_prefix('.') {
        Some(rest) => format!("%2E{}", utf8_percent_encode(rest, FILE_NAME_ESCAPES)),
        None => utf8_percent_encode(id, FILE_NAME_ESCAPES).to_string(),
    };
    if name.is_empty() {
        name.push('%');
    }
    if !extension.is_empty() {
        name.push('.');
        name.push_str(extension.trim_start_matches('.'));
    }
    download_dir.join(name)
}

/// Handle to the download registry.
///
/// Cheap to clone; all clones talk to the same worker. The worker stops
/// after [`DownloadManager::shutdown`] or once every clone is dropped.
#[derive(Clone)]
pub struct DownloadManager {
    commands: mpsc::UnboundedSender<Message>,
    hub: Arc<SnapshotHub>,
    ready: watch::Receiver<bool>,
}

impl DownloadManager {
    /// Spawn the registry worker. Must be called inside a tokio runtime.
    ///
    /// The worker first creates the download directory, loads the store and
    /// fails any item left `downloading` by a previous process; only then
    /// does it publish. Commands sent before that are queued, not lost.
    pub fn new(
        config: Config,
        store: Arc<dyn DownloadStore>,
        engine: Arc<dyn TransferEngine>,
    ) -> Self {
        let hub = SnapshotHub::new();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready) = watch::channel(false);

        let worker = Worker {
            config,
            store,
            engine,
            hub: Arc::clone(&hub),
            messages: commands.downgrade(),
            items: Vec::new(),
            active: HashMap::new(),
            next_serial: 0,
        };
        tokio::spawn(worker.run(command_rx, ready_tx));

        Self {
            commands,
            hub,
            ready,
        }
    }

    /// Spawn the worker and wait until it has initialized.
    pub async fn initialize(
        config: Config,
        store: Arc<dyn DownloadStore>,
        engine: Arc<dyn TransferEngine>,
    ) -> Self {
        let manager = Self::new(config, store, engine);
        manager.ready().await;
        manager
    }

    /// JSON file store at `config.state_file` and the HTTP engine.
    pub async fn from_config(config: Config) -> Result<Self> {
        let store = Arc::new(JsonFileStore::new(config.state_file.clone()));
        let engine = Arc::new(HttpTransferEngine::new(&config)?);
        Ok(Self::initialize(config, store, engine).await)
    }

    /// Resolves once persisted state has been loaded and published.
    pub async fn ready(&self) {
        let mut ready = self.ready.clone();
        let _ = ready.wait_for(|ready| *ready).await;
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Send a command and wait until the worker has applied it.
    ///
    /// Once the worker has stopped, commands are silently ignored.
    pub async fn send(&self, command: DownloadCommand) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Message::Command(command, done_tx)).is_err() {
            tracing::debug!("Download manager has stopped; ignoring command");
            return;
        }
        let _ = done_rx.await;
    }

    pub async fn start(&self, request: DownloadRequest) {
        self.send(DownloadCommand::Start(request)).await
    }

    pub async fn pause(&self, id: impl Into<String>) {
        self.send(DownloadCommand::Pause { id: id.into() }).await
    }

    pub async fn resume(&self, id: impl Into<String>) {
        self.send(DownloadCommand::Resume { id: id.into() }).await
    }

    pub async fn retry(&self, id: impl Into<String>) {
        self.send(DownloadCommand::Retry { id: id.into() }).await
    }

    pub async fn delete(&self, id: impl Into<String>) {
        self.send(DownloadCommand::Delete { id: id.into() }).await
    }

    pub async fn clear_all(&self) {
        self.send(DownloadCommand::ClearAll).await
    }

    /// Pause running transfers so they can be resumed by the next process,
    /// persist, and stop the worker.
    pub async fn shutdown(&self) {
        self.send(DownloadCommand::Shutdown).await
    }

    /// Wait until every command and transfer callback queued before this
    /// call has been applied.
    pub async fn sync(&self) {
        self.send(DownloadCommand::Sync).await
    }

    /// Latest snapshot of every item.
    pub fn snapshot(&self) -> Snapshot {
        self.hub.current()
    }

    pub fn get_all(&self) -> Vec<DownloadItem> {
        self.hub.current().to_vec()
    }

    pub fn get(&self, id: &str) -> Option<DownloadItem> {
        self.hub.current().get(id).cloned()
    }

    /// True if any item of this content has finished downloading.
    pub fn is_completed(&self, content_id: &str) -> bool {
        self.hub
            .current()
            .iter()
            .any(|item| item.content_id == content_id && item.status == DownloadStatus::Completed)
    }

    /// First item belonging to this content, in registry order.
    pub fn status_of(&self, content_id: &str) -> Option<DownloadItem> {
        self.hub
            .current()
            .iter()
            .find(|item| item.content_id == content_id)
            .cloned()
    }

    pub fn counts(&self) -> StatusCounts {
        StatusCounts::tally(self.hub.current().iter())
    }

    /// Observe changes with a callback; see [`SnapshotHub::subscribe`].
    pub fn subscribe(&self, callback: impl Fn(&Snapshot) + Send + Sync + 'static) -> Subscription {
        self.hub.subscribe(callback)
    }

    /// Observe changes as an async stream.
    pub fn events(&self) -> SnapshotStream {
        self.hub.events()
    }
}

/// Bookkeeping for one live transfer.
struct ActiveTransfer {
    serial: TransferSerial,
    /// `None` once a pause found the transfer already finishing; its
    /// terminal callback is still accepted.
    handle: Option<TransferHandle>,
}

struct Worker {
    config: Config,
    store: Arc<dyn DownloadStore>,
    engine: Arc<dyn TransferEngine>,
    hub: Arc<SnapshotHub>,
    /// Weak so that dropping every manager handle stops the worker.
    messages: mpsc::WeakUnboundedSender<Message>,
    items: Vec<DownloadItem>,
    active: HashMap<String, ActiveTransfer>,
    next_serial: TransferSerial,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>, ready: watch::Sender<bool>) {
        self.initialize().await;
        let _ = ready.send(true);

        while let Some(message) = rx.recv().await {
            match message {
                Message::Transfer(event) => self.on_transfer_event(event).await,
                Message::Command(DownloadCommand::Shutdown, done) => {
                    self.shutdown(&mut rx).await;
                    let _ = done.send(());
                    break;
                }
                Message::Command(command, done) => {
                    self.apply(command).await;
                    let _ = done.send(());
                }
            }
        }

        tracing::debug!("Download worker stopped");
    }

    async fn initialize(&mut self) {
        if let Err(e) = fs::create_dir_all(&self.config.download_dir).await {
            tracing::warn!(
                "Failed to create download directory {:?}: {}",
                self.config.download_dir,
                e
            );
        }

        let store = Arc::clone(&self.store);
        let loaded = tokio::task::spawn_blocking(move || store.load())
            .await
            .unwrap_or_else(|e| Err(anyhow::anyhow!("store load task failed: {}", e)));
        let mut items = match loaded {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!("Failed to load download state, starting empty: {:#}", e);
                Vec::new()
            }
        };

        let mut seen = HashSet::new();
        items.retain(|item| seen.insert(item.id.clone()));

        // Nothing is transferring in a fresh process.
        let mut stale = 0;
        for item in items.iter_mut().filter(|item| item.status == DownloadStatus::Downloading) {
            item.status = DownloadStatus::Failed;
            item.progress = 0.0;
            stale += 1;
        }

        self.items = items;
        if stale > 0 {
            tracing::info!("Marked {} interrupted download(s) as failed", stale);
            self.persist().await;
        }
        self.publish();

        tracing::info!(items = self.items.len(), "Download manager ready");
    }

    async fn apply(&mut self, command: DownloadCommand) {
        match command {
            DownloadCommand::Start(request) => self.start(request).await,
            DownloadCommand::Pause { id } => self.pause(&id).await,
            DownloadCommand::Resume { id } => self.resume(&id).await,
            DownloadCommand::Retry { id } => self.retry(&id).await,
            DownloadCommand::Delete { id } => self.delete(&id).await,
            DownloadCommand::ClearAll => self.clear_all().await,
            DownloadCommand::Sync => {}
            // Handled by the run loop.
            DownloadCommand::Shutdown => {}
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    async fn start(&mut self, request: DownloadRequest) {
        if request.id.is_empty() {
            tracing::warn!("Ignoring download request without an id");
            return;
        }

        let existing = self.position(&request.id);
        if let Some(idx) = existing {
            if self.items[idx].status == DownloadStatus::Completed {
                tracing::info!(id = %request.id, "Already downloaded; ignoring start");
                return;
            }
        }

        // Precondition for the new transfer: nothing else writes this path.
        self.cancel_transfer(&request.id).await;

        let local_path =
            local_path_for(&self.config.download_dir, &request.id, &self.config.file_extension);
        let item = DownloadItem::from_request(request, local_path);
        tracing::info!(id = %item.id, "Starting download: {}", item.label());

        let transfer = TransferRequest {
            id: item.id.clone(),
            url: item.remote_url.clone(),
            destination: item.local_path.clone(),
            resume_from: None,
        };
        match existing {
            Some(idx) => self.items[idx] = item,
            None => self.items.insert(0, item),
        }

        self.begin(transfer);
        self.commit().await;
    }

    async fn pause(&mut self, id: &str) {
        let Some(idx) = self.position(id) else {
            tracing::debug!(id, "Pause for unknown download ignored");
            return;
        };
        if self.items[idx].status != DownloadStatus::Downloading {
            tracing::debug!(id, status = %self.items[idx].status, "Pause ignored");
            return;
        }
        let Some(handle) = self.active.get_mut(id).and_then(|active| active.handle.take()) else {
            tracing::debug!(id, "No running transfer to pause");
            return;
        };

        match handle.pause().await {
            Some(token) => {
                self.active.remove(id);
                let item = &mut self.items[idx];
                item.status = DownloadStatus::Paused;
                item.resume_token = Some(token);
                tracing::info!(id, progress = item.progress, "Download paused");
                self.commit().await;
            }
            None => {
                tracing::debug!(id, "Transfer finished before it could pause");
            }
        }
    }

    async fn resume(&mut self, id: &str) {
        let Some(idx) = self.position(id) else {
            tracing::debug!(id, "Resume for unknown download ignored");
            return;
        };
        if self.items[idx].status != DownloadStatus::Paused {
            tracing::debug!(id, status = %self.items[idx].status, "Resume ignored");
            return;
        }
        let Some(token) = self.items[idx].resume_token.take() else {
            tracing::debug!(id, "Paused download has no resume token; resume ignored");
            return;
        };

        self.cancel_transfer(id).await;

        let item = &mut self.items[idx];
        item.status = DownloadStatus::Downloading;
        item.progress = 0.0;
        let resume_from = match self.config.resume_mode {
            ResumeMode::Checkpoint => Some(token),
            ResumeMode::Restart => None,
        };
        let transfer = TransferRequest {
            id: item.id.clone(),
            url: item.remote_url.clone(),
            destination: item.local_path.clone(),
            resume_from,
        };
        tracing::info!(id, "Resuming download");

        self.begin(transfer);
        self.commit().await;
    }

    async fn retry(&mut self, id: &str) {
        let request = match self.position(id) {
            Some(idx) if self.items[idx].status == DownloadStatus::Failed => {
                self.items[idx].to_request()
            }
            _ => {
                tracing::debug!(id, "Retry ignored; download is not failed");
                return;
            }
        };
        self.start(request).await;
    }

    async fn delete(&mut self, id: &str) {
        let Some(idx) = self.position(id) else {
            tracing::debug!(id, "Delete for unknown download ignored");
            return;
        };

        self.cancel_transfer(id).await;
        let item = self.items.remove(idx);
        remove_file_best_effort(&item.local_path).await;
        remove_file_best_effort(&partial_path(&item.local_path)).await;

        tracing::info!(id, "Download deleted");
        self.commit().await;
    }

    async fn clear_all(&mut self) {
        let ids: Vec<String> = self.active.keys().cloned().collect();
        for id in ids {
            self.cancel_transfer(&id).await;
        }

        let dir = self.config.download_dir.clone();
        if let Err(e) = fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove download directory {:?}: {}", dir, e);
            }
        }
        if let Err(e) = fs::create_dir_all(&dir).await {
            tracing::warn!("Failed to recreate download directory {:?}: {}", dir, e);
        }

        let removed = self.items.len();
        self.items.clear();
        tracing::info!(removed, "Cleared all downloads");
        self.commit().await;
    }

    async fn shutdown(&mut self, rx: &mut mpsc::UnboundedReceiver<Message>) {
        let ids: Vec<String> = self.active.keys().cloned().collect();
        for id in &ids {
            self.pause(id).await;
        }

        // Transfers that finished instead of pausing have already queued
        // their outcome; apply those, refuse anything else.
        while let Ok(message) = rx.try_recv() {
            match message {
                Message::Transfer(event) => self.on_transfer_event(event).await,
                Message::Command(command, done) => {
                    tracing::debug!(?command, "Command after shutdown ignored");
                    let _ = done.send(());
                }
            }
        }

        self.active.clear();
        self.commit().await;
        tracing::info!(paused = ids.len(), "Download manager shut down");
    }

    async fn on_transfer_event(&mut self, event: TransferEvent) {
        let live = self
            .active
            .get(&event.id)
            .is_some_and(|active| active.serial == event.serial);
        if !live {
            tracing::debug!(id = %event.id, serial = event.serial, "Ignoring event from a discarded transfer");
            return;
        }
        let Some(idx) = self.position(&event.id) else {
            self.active.remove(&event.id);
            return;
        };
        if self.items[idx].status != DownloadStatus::Downloading {
            return;
        }

        match event.kind {
            TransferEventKind::Progress(fraction) => {
                let item = &mut self.items[idx];
                let progress = (fraction * 100.0).clamp(0.0, 100.0);
                if progress > item.progress {
                    item.progress = progress;
                    tracing::debug!(id = %event.id, progress, "Progress");
                    self.publish();
                }
            }
            TransferEventKind::Completed(path) => {
                self.active.remove(&event.id);
                let item = &mut self.items[idx];
                item.status = DownloadStatus::Completed;
                item.progress = 100.0;
                item.local_path = path;
                item.resume_token = None;
                tracing::info!(id = %event.id, "Download complete: {:?}", item.local_path);
                self.commit().await;
            }
            TransferEventKind::Failed(reason) => {
                self.active.remove(&event.id);
                let item = &mut self.items[idx];
                item.status = DownloadStatus::Failed;
                item.progress = 0.0;
                item.resume_token = None;
                tracing::warn!(id = %event.id, "Download failed: {}", reason);
                self.commit().await;
            }
        }
    }

    fn begin(&mut self, request: TransferRequest) {
        self.next_serial += 1;
        let serial = self.next_serial;
        let (handle, control) = TransferHandle::pair();

        let messages = self.messages.clone();
        let sink = TransferSink::new(request.id.clone(), serial, move |event| {
            if let Some(tx) = messages.upgrade() {
                let _ = tx.send(Message::Transfer(event));
            }
        });

        self.active.insert(
            request.id.clone(),
            ActiveTransfer {
                serial,
                handle: Some(handle),
            },
        );
        self.engine.begin(request, sink, control);
    }

    /// Cancel the live transfer for `id`, if any, and wait for it to stop.
    async fn cancel_transfer(&mut self, id: &str) {
        if let Some(active) = self.active.remove(id) {
            if let Some(handle) = active.handle {
                handle.cancel().await;
                tracing::debug!(id, serial = active.serial, "Transfer cancelled");
            }
        }
    }

    /// Persist and publish after a durable transition.
    async fn commit(&self) {
        self.persist().await;
        self.publish();
    }

    /// Stores may block on file locks, so saves run off the runtime threads.
    /// The worker awaits each one, keeping saves in transition order.
    async fn persist(&self) {
        let store = Arc::clone(&self.store);
        let items = self.items.clone();
        let saved = tokio::task::spawn_blocking(move || store.save(&items))
            .await
            .unwrap_or_else(|e| Err(anyhow::anyhow!("store save task failed: {}", e)));
        if let Err(e) = saved {
            tracing::warn!("Failed to persist download state: {:#}", e);
        }
    }

    fn publish(&self) {
        self.hub.publish(self.items.clone());
    }
}

async fn remove_file_best_effort(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to delete {:?}: {}", path, e);
        }
    }
}
