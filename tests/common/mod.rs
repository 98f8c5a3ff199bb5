// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Shared fixtures: a transfer engine driven by the test and a harness
//! around a `DownloadManager` in a temp directory.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mediadl::config::Config;
use mediadl::download::{
    DownloadManager, DownloadRequest, MemoryStore, ResumeToken, TransferControl, TransferEngine,
    TransferRequest, TransferSignal, TransferSink,
};
use tempfile::TempDir;

#[derive(Default)]
struct ScriptState {
    begins: Vec<TransferRequest>,
    live: HashMap<String, TransferSink>,
}

/// Engine whose transfers only move when the test says so.
///
/// Pause hands back `scripted:<n>`, cancel just stops. With
/// [`ScriptedEngine::finish_on_pause`] the transfer completes instead of
/// pausing, like a download whose last byte lands as the pause arrives.
#[derive(Default)]
pub struct ScriptedEngine {
    state: Arc<Mutex<ScriptState>>,
    pauses: Arc<AtomicUsize>,
    finish_on_pause: Arc<AtomicBool>,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn finish_on_pause(&self, enabled: bool) {
        self.finish_on_pause.store(enabled, Ordering::SeqCst);
    }

    /// Every request passed to `begin`, oldest first.
    pub fn begins(&self) -> Vec<TransferRequest> {
        self.state.lock().unwrap().begins.clone()
    }

    pub fn begin_count(&self, id: &str) -> usize {
        self.begins().iter().filter(|r| r.id == id).count()
    }

    pub fn last_begin(&self, id: &str) -> Option<TransferRequest> {
        self.begins().into_iter().rev().find(|r| r.id == id)
    }

    /// Take the live sink for `id` so the test can report through it even
    /// after the registry has moved on.
    pub fn take_sink(&self, id: &str) -> Option<TransferSink> {
        self.state.lock().unwrap().live.remove(id)
    }

    pub fn progress(&self, id: &str, fraction: f64) {
        if let Some(sink) = self.state.lock().unwrap().live.get_mut(id) {
            sink.progress(fraction);
        }
    }

    pub fn complete(&self, id: &str) {
        let destination = self.last_begin(id).map(|r| r.destination);
        if let (Some(sink), Some(destination)) = (self.take_sink(id), destination) {
            sink.complete(destination);
        }
    }

    pub fn fail(&self, id: &str, reason: &str) {
        if let Some(sink) = self.take_sink(id) {
            sink.fail(reason);
        }
    }
}

impl TransferEngine for ScriptedEngine {
    fn begin(&self, request: TransferRequest, sink: TransferSink, mut control: TransferControl) {
        let id = request.id.clone();
        let serial = sink.serial();
        let destination = request.destination.clone();
        {
            let mut state = self.state.lock().unwrap();
            state.begins.push(request);
            state.live.insert(id.clone(), sink);
        }

        let state = Arc::clone(&self.state);
        let pauses = Arc::clone(&self.pauses);
        let finish_on_pause = Arc::clone(&self.finish_on_pause);
        tokio::spawn(async move {
            let signal = control.interrupted().await;

            // Only touch the sink if it still belongs to this transfer.
            let sink = {
                let mut state = state.lock().unwrap();
                match state.live.get(&id) {
                    Some(sink) if sink.serial() == serial => state.live.remove(&id),
                    _ => None,
                }
            };

            match signal {
                TransferSignal::Pause if finish_on_pause.load(Ordering::SeqCst) => {
                    if let Some(sink) = sink {
                        sink.complete(destination);
                    }
                }
                TransferSignal::Pause => {
                    let n = pauses.fetch_add(1, Ordering::SeqCst) + 1;
                    control.checkpoint(ResumeToken::new(format!("scripted:{}", n)));
                    if let Some(sink) = sink {
                        sink.detach();
                    }
                }
                TransferSignal::Cancel | TransferSignal::Run => {
                    if let Some(sink) = sink {
                        sink.detach();
                    }
                }
            }
        });
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub config: Config,
    pub store: Arc<MemoryStore>,
    pub engine: Arc<ScriptedEngine>,
    pub manager: DownloadManager,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(MemoryStore::new(), |_| {}).await
    }

    pub async fn with(store: MemoryStore, configure: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::rooted_at(dir.path());
        configure(&mut config);
        let store = Arc::new(store);
        let engine = ScriptedEngine::new();
        let manager =
            DownloadManager::initialize(config.clone(), store.clone(), engine.clone()).await;
        Self {
            dir,
            config,
            store,
            engine,
            manager,
        }
    }
}

pub fn movie(content_id: &str) -> DownloadRequest {
    DownloadRequest::movie(
        content_id,
        format!("Title {}", content_id),
        "1080p",
        format!("https://cdn.example/{}.mp4", content_id),
    )
}
