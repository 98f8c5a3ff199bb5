// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transfer engine seam.
//!
//! The registry never touches bytes. For every transfer it creates a
//! [`TransferHandle`]/[`TransferControl`] pair, keeps the handle (pause and
//! cancel only) and gives the control side plus a [`TransferSink`] to the
//! engine. The engine reports progress and exactly one terminal outcome
//! through the sink.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{oneshot, watch};

use super::types::ResumeToken;

/// Identifies one `begin` call. A restarted id gets a new serial, which is
/// how late callbacks from the old transfer are told apart.
pub type TransferSerial = u64;

/// Where a transfer writes until it completes: `<destination>.part`.
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name: OsString = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// What the engine is asked to fetch.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub id: String,
    pub url: String,
    pub destination: PathBuf,
    /// Checkpoint from a previous pause, if the transfer should continue
    pub resume_from: Option<ResumeToken>,
}

/// Performs byte transfers. Implementations spawn their own task and return
/// immediately.
pub trait TransferEngine: Send + Sync + 'static {
    fn begin(&self, request: TransferRequest, sink: TransferSink, control: TransferControl);
}

/// Requested state of a running transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSignal {
    Run,
    Pause,
    Cancel,
}

/// Registry side of a transfer: pause or cancel, nothing else.
///
/// Dropping the handle cancels the transfer.
#[derive(Debug)]
pub struct TransferHandle {
    signal: watch::Sender<TransferSignal>,
    checkpoint: oneshot::Receiver<ResumeToken>,
}

impl TransferHandle {
    /// Create a connected handle/control pair.
    pub fn pair() -> (TransferHandle, TransferControl) {
        let (signal_tx, signal_rx) = watch::channel(TransferSignal::Run);
        let (checkpoint_tx, checkpoint_rx) = oneshot::channel();
        (
            TransferHandle {
                signal: signal_tx,
                checkpoint: checkpoint_rx,
            },
            TransferControl {
                signal: signal_rx,
                checkpoint: Some(checkpoint_tx),
            },
        )
    }

    /// Ask the transfer to suspend and wait for its checkpoint.
    ///
    /// `None` means the transfer ended on its own before it could pause; its
    /// terminal callback is (or will be) in flight.
    pub async fn pause(self) -> Option<ResumeToken> {
        if self.signal.send(TransferSignal::Pause).is_err() {
            return None;
        }
        self.checkpoint.await.ok()
    }

    /// Ask the transfer to stop and wait until the engine has let go of its
    /// [`TransferControl`]. Returns at once if it already finished.
    pub async fn cancel(self) {
        if self.signal.send(TransferSignal::Cancel).is_err() {
            return;
        }
        let _ = self.checkpoint.await;
    }
}

/// Engine side of a transfer: observe pause/cancel requests, hand back a
/// checkpoint.
#[derive(Debug)]
pub struct TransferControl {
    signal: watch::Receiver<TransferSignal>,
    checkpoint: Option<oneshot::Sender<ResumeToken>>,
}

impl TransferControl {
    /// Current request without waiting. A dropped handle reads as `Cancel`.
    pub fn current(&self) -> TransferSignal {
        if self.signal.has_changed().is_err() {
            return TransferSignal::Cancel;
        }
        *self.signal.borrow()
    }

    /// Resolves when pause or cancel is requested. Cancel-safe.
    pub async fn interrupted(&mut self) -> TransferSignal {
        loop {
            let signal = *self.signal.borrow_and_update();
            if signal != TransferSignal::Run {
                return signal;
            }
            if self.signal.changed().await.is_err() {
                return TransferSignal::Cancel;
            }
        }
    }

    /// Hand the pause checkpoint back to the waiting registry.
    pub fn checkpoint(&mut self, token: ResumeToken) {
        if let Some(tx) = self.checkpoint.take() {
            let _ = tx.send(token);
        }
    }
}

/// What a transfer reports.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEventKind {
    /// Fraction of the total, 0.0..=1.0
    Progress(f64),
    Completed(PathBuf),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferEvent {
    pub id: String,
    pub serial: TransferSerial,
    pub kind: TransferEventKind,
}

type Reporter = Arc<dyn Fn(TransferEvent) + Send + Sync>;

/// Progress and outcome reporter for one `begin` call.
///
/// `complete` and `fail` consume the sink, so at most one terminal event is
/// sent. Dropping a sink that never reported an outcome (an aborted or
/// panicked task) reports a failure; [`TransferSink::detach`] is the way to
/// end a paused or cancelled transfer silently.
pub struct TransferSink {
    id: String,
    serial: TransferSerial,
    report: Reporter,
    last_fraction: f64,
    finished: bool,
}

impl TransferSink {
    pub fn new(
        id: impl Into<String>,
        serial: TransferSerial,
        report: impl Fn(TransferEvent) + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            serial,
            report: Arc::new(report),
            last_fraction: 0.0,
            finished: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn serial(&self) -> TransferSerial {
        self.serial
    }

    /// Highest fraction reported so far.
    pub fn last_fraction(&self) -> f64 {
        self.last_fraction
    }

    /// Report progress. Values are clamped to 0..=1 and never go backwards;
    /// a value that does not move forward is not sent.
    pub fn progress(&mut self, fraction: f64) {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if fraction <= self.last_fraction {
            return;
        }
        self.last_fraction = fraction;
        self.emit(TransferEventKind::Progress(fraction));
    }

    pub fn complete(mut self, final_path: PathBuf) {
        self.finished = true;
        self.emit(TransferEventKind::Completed(final_path));
    }

    pub fn fail(mut self, reason: impl fmt::Display) {
        self.finished = true;
        self.emit(TransferEventKind::Failed(reason.to_string()));
    }

    /// End without an outcome (paused or cancelled).
    pub fn detach(mut self) {
        self.finished = true;
    }

    fn emit(&self, kind: TransferEventKind) {
        (self.report)(TransferEvent {
            id: self.id.clone(),
            serial: self.serial,
            kind,
        });
    }
}

impl Drop for TransferSink {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            self.emit(TransferEventKind::Failed(
                "transfer ended without reporting an outcome".to_string(),
            ));
        }
    }
}

impl fmt::Debug for TransferSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferSink")
            .field("id", &self.id)
            .field("serial", &self.serial)
            .field("last_fraction", &self.last_fraction)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording_sink() -> (TransferSink, Arc<Mutex<Vec<TransferEventKind>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let sink = TransferSink::new("a", 1, move |ev| sink_events.lock().unwrap().push(ev.kind));
        (sink, events)
    }

    #[test]
    fn test_partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/d/42-hd.mp4")),
            PathBuf::from("/d/42-hd.mp4.part")
        );
    }

    #[test]
    fn test_progress_is_clamped_and_monotonic() {
        let (mut sink, events) = recording_sink();
        sink.progress(0.2);
        sink.progress(0.1);
        sink.progress(0.2);
        sink.progress(7.0);
        sink.progress(f64::NAN);
        sink.detach();

        let events = events.lock().unwrap();
        assert_eq!(
            *events,
            vec![TransferEventKind::Progress(0.2), TransferEventKind::Progress(1.0)]
        );
    }

    #[test]
    fn test_single_terminal_event() {
        let (mut sink, events) = recording_sink();
        sink.progress(0.5);
        sink.complete(PathBuf::from("/d/a.mp4"));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], TransferEventKind::Completed(PathBuf::from("/d/a.mp4")));
    }

    #[test]
    fn test_dropped_sink_reports_failure() {
        let (sink, events) = recording_sink();
        drop(sink);
        let events = events.lock().unwrap();
        assert!(matches!(events.as_slice(), [TransferEventKind::Failed(_)]));
    }

    #[tokio::test]
    async fn test_pause_returns_checkpoint() {
        let (handle, mut control) = TransferHandle::pair();
        let engine = tokio::spawn(async move {
            assert_eq!(control.interrupted().await, TransferSignal::Pause);
            control.checkpoint(ResumeToken::new("bytes=10"));
        });

        let token = handle.pause().await;
        assert_eq!(token, Some(ResumeToken::new("bytes=10")));
        engine.await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_after_transfer_finished_returns_none() {
        let (handle, control) = TransferHandle::pair();
        drop(control);
        assert_eq!(handle.pause().await, None);
    }

    #[tokio::test]
    async fn test_cancel_waits_for_engine_to_stop() {
        let (handle, mut control) = TransferHandle::pair();
        let stopped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&stopped);
        tokio::spawn(async move {
            assert_eq!(control.interrupted().await, TransferSignal::Cancel);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            drop(control);
        });

        handle.cancel().await;
        assert!(stopped.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dropped_handle_reads_as_cancel() {
        let (handle, mut control) = TransferHandle::pair();
        assert_eq!(control.current(), TransferSignal::Run);
        drop(handle);
        assert_eq!(control.current(), TransferSignal::Cancel);
        assert_eq!(control.interrupted().await, TransferSignal::Cancel);
    }
}
