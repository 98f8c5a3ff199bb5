// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP transfer engine against a local axum server.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{CONTENT_LENGTH, CONTENT_RANGE, ETAG, RANGE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::timeout;

use mediadl::config::Config;
use mediadl::download::{
    partial_path, Checkpoint, DownloadManager, DownloadRequest, DownloadStatus, HttpTransferEngine,
    MemoryStore, ResumeToken, TransferEngine, TransferEventKind, TransferHandle, TransferRequest,
    TransferSink,
};

const BODY_LEN: usize = 64 * 1024;
const CHUNK: usize = 4 * 1024;
const TEST_TIMEOUT_SECS: u64 = 20;

#[derive(Clone)]
struct ServerState {
    body: Arc<Vec<u8>>,
    ranges: Arc<Mutex<Vec<Option<String>>>>,
    honour_ranges: bool,
    /// Answer range requests with 206 for an earlier start than asked.
    shift_ranges: bool,
    chunk_delay: Duration,
}

impl ServerState {
    fn new(honour_ranges: bool, chunk_delay: Duration) -> Self {
        let body: Vec<u8> = (0..BODY_LEN).map(|i| (i % 251) as u8).collect();
        Self {
            body: Arc::new(body),
            ranges: Arc::new(Mutex::new(Vec::new())),
            honour_ranges,
            shift_ranges: false,
            chunk_delay,
        }
    }

    fn shifting_ranges(mut self) -> Self {
        self.shift_ranges = true;
        self
    }

    fn ranges(&self) -> Vec<Option<String>> {
        self.ranges.lock().unwrap().clone()
    }

    fn last_range(&self) -> Option<String> {
        self.ranges.lock().unwrap().last().cloned().flatten()
    }
}

fn range_start(header: &str) -> Option<usize> {
    header.strip_prefix("bytes=")?.strip_suffix('-')?.parse().ok()
}

async fn serve_file(State(state): State<ServerState>, headers: HeaderMap) -> Response {
    let range = headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.ranges.lock().unwrap().push(range.clone());

    let total = state.body.len();
    let mut start = if state.honour_ranges {
        range.as_deref().and_then(range_start).unwrap_or(0)
    } else {
        0
    };
    if start >= total && start > 0 {
        return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
    }
    if state.shift_ranges {
        start /= 2;
    }

    let chunks: Vec<Bytes> = state.body[start..]
        .chunks(CHUNK)
        .map(Bytes::copy_from_slice)
        .collect();
    let delay = state.chunk_delay;
    let stream = futures_util::stream::iter(chunks).then(move |chunk| async move {
        tokio::time::sleep(delay).await;
        Ok::<_, std::io::Error>(chunk)
    });

    let mut builder = axum::http::Response::builder()
        .header(CONTENT_LENGTH, total - start)
        .header(ETAG, "\"v1\"");
    builder = if range.is_some() && state.honour_ranges {
        builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(CONTENT_RANGE, format!("bytes {}-{}/{}", start, total - 1, total))
    } else {
        builder.status(StatusCode::OK)
    };
    builder.body(Body::from_stream(stream)).unwrap()
}

async fn spawn_server(state: ServerState) -> String {
    let app = Router::new()
        .route("/file", get(serve_file))
        .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn engine() -> HttpTransferEngine {
    HttpTransferEngine::with_client(reqwest::Client::new(), 0.0)
}

fn begin(
    engine: &HttpTransferEngine,
    url: String,
    destination: &Path,
    resume_from: Option<ResumeToken>,
) -> (TransferHandle, mpsc::UnboundedReceiver<TransferEventKind>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = TransferSink::new("t", 1, move |event| {
        let _ = tx.send(event.kind);
    });
    let (handle, control) = TransferHandle::pair();
    engine.begin(
        TransferRequest {
            id: "t".to_string(),
            url,
            destination: destination.to_path_buf(),
            resume_from,
        },
        sink,
        control,
    );
    (handle, rx)
}

/// First non-progress event.
async fn outcome(rx: &mut mpsc::UnboundedReceiver<TransferEventKind>) -> Option<TransferEventKind> {
    timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        while let Some(kind) = rx.recv().await {
            if !matches!(kind, TransferEventKind::Progress(_)) {
                return Some(kind);
            }
        }
        None
    })
    .await
    .expect("transfer timed out")
}

async fn wait_for_progress(rx: &mut mpsc::UnboundedReceiver<TransferEventKind>, at_least: f64) {
    timeout(Duration::from_secs(TEST_TIMEOUT_SECS), async {
        while let Some(kind) = rx.recv().await {
            match kind {
                TransferEventKind::Progress(f) if f >= at_least => return,
                TransferEventKind::Progress(_) => {}
                other => panic!("transfer ended early: {:?}", other),
            }
        }
        panic!("transfer ended without events");
    })
    .await
    .expect("no progress");
}

#[tokio::test]
async fn test_full_download_lands_at_destination() {
    let state = ServerState::new(true, Duration::ZERO);
    let base = spawn_server(state.clone()).await;
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("movie.mp4");

    let (_handle, mut rx) = begin(&engine(), format!("{}/file", base), &dest, None);

    assert_eq!(outcome(&mut rx).await, Some(TransferEventKind::Completed(dest.clone())));
    assert_eq!(std::fs::read(&dest).unwrap(), *state.body);
    assert!(!partial_path(&dest).exists());
    assert_eq!(state.last_range(), None);
}

#[tokio::test]
async fn test_pause_then_resume_continues_with_range() {
    let state = ServerState::new(true, Duration::from_millis(20));
    let base = spawn_server(state.clone()).await;
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("movie.mp4");
    let engine = engine();

    let (handle, mut rx) = begin(&engine, format!("{}/file", base), &dest, None);
    wait_for_progress(&mut rx, 0.2).await;
    let token = handle.pause().await.expect("checkpoint");

    let checkpoint = Checkpoint::decode(&token).unwrap();
    assert!(checkpoint.bytes > 0 && checkpoint.bytes < BODY_LEN as u64);
    assert_eq!(checkpoint.total, Some(BODY_LEN as u64));
    assert_eq!(
        std::fs::metadata(partial_path(&dest)).unwrap().len(),
        checkpoint.bytes
    );
    // Paused transfers end silently.
    assert_eq!(outcome(&mut rx).await, None);
    assert!(!dest.exists());

    let (_handle, mut rx) = begin(&engine, format!("{}/file", base), &dest, Some(token));
    assert_eq!(outcome(&mut rx).await, Some(TransferEventKind::Completed(dest.clone())));
    assert_eq!(state.last_range(), Some(format!("bytes={}-", checkpoint.bytes)));
    assert_eq!(std::fs::read(&dest).unwrap(), *state.body);
}

#[tokio::test]
async fn test_resume_without_range_support_restarts_cleanly() {
    let state = ServerState::new(false, Duration::from_millis(20));
    let base = spawn_server(state.clone()).await;
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("movie.mp4");
    let engine = engine();

    let (handle, mut rx) = begin(&engine, format!("{}/file", base), &dest, None);
    wait_for_progress(&mut rx, 0.2).await;
    let token = handle.pause().await.expect("checkpoint");

    let (_handle, mut rx) = begin(&engine, format!("{}/file", base), &dest, Some(token));
    assert_eq!(outcome(&mut rx).await, Some(TransferEventKind::Completed(dest.clone())));
    assert_eq!(std::fs::read(&dest).unwrap(), *state.body);
}

#[tokio::test]
async fn test_mismatched_content_range_restarts_cleanly() {
    let state = ServerState::new(true, Duration::from_millis(20)).shifting_ranges();
    let base = spawn_server(state.clone()).await;
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("movie.mp4");
    let engine = engine();

    let (handle, mut rx) = begin(&engine, format!("{}/file", base), &dest, None);
    wait_for_progress(&mut rx, 0.2).await;
    let token = handle.pause().await.expect("checkpoint");
    let bytes = Checkpoint::decode(&token).unwrap().bytes;

    let (_handle, mut rx) = begin(&engine, format!("{}/file", base), &dest, Some(token));
    assert_eq!(outcome(&mut rx).await, Some(TransferEventKind::Completed(dest.clone())));
    assert_eq!(
        state.ranges(),
        vec![None, Some(format!("bytes={}-", bytes)), None]
    );
    assert_eq!(std::fs::read(&dest).unwrap(), *state.body);
}

#[tokio::test]
async fn test_foreign_token_downloads_from_scratch() {
    let state = ServerState::new(true, Duration::ZERO);
    let base = spawn_server(state.clone()).await;
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("movie.mp4");

    let token = ResumeToken::new("scripted:3");
    let (_handle, mut rx) = begin(&engine(), format!("{}/file", base), &dest, Some(token));

    assert_eq!(outcome(&mut rx).await, Some(TransferEventKind::Completed(dest.clone())));
    assert_eq!(state.last_range(), None);
}

#[tokio::test]
async fn test_http_error_fails_transfer() {
    let base = spawn_server(ServerState::new(true, Duration::ZERO)).await;
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("missing.mp4");

    let (_handle, mut rx) = begin(&engine(), format!("{}/missing", base), &dest, None);

    match outcome(&mut rx).await {
        Some(TransferEventKind::Failed(reason)) => assert!(reason.contains("404"), "{}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_cancel_removes_partial_file() {
    let state = ServerState::new(true, Duration::from_millis(20));
    let base = spawn_server(state).await;
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("movie.mp4");

    let (handle, mut rx) = begin(&engine(), format!("{}/file", base), &dest, None);
    wait_for_progress(&mut rx, 0.1).await;
    handle.cancel().await;

    assert!(!partial_path(&dest).exists());
    assert!(!dest.exists());
    assert_eq!(outcome(&mut rx).await, None);
}

#[tokio::test]
async fn test_manager_downloads_pauses_and_resumes_over_http() {
    let state = ServerState::new(true, Duration::from_millis(20));
    let base = spawn_server(state.clone()).await;
    let dir = tempfile::TempDir::new().unwrap();
    let config = Config::rooted_at(dir.path());
    let manager = DownloadManager::initialize(
        config.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(HttpTransferEngine::with_client(reqwest::Client::new(), 0.05)),
    )
    .await;

    let request = DownloadRequest::movie("42", "Heat", "1080p", format!("{}/file", base));
    let id = request.id.clone();
    let mut events = manager.events();
    manager.start(request).await;

    timeout(
        Duration::from_secs(TEST_TIMEOUT_SECS),
        events.wait_for(|snap| snap.get(&id).is_some_and(|item| item.progress >= 20.0)),
    )
    .await
    .expect("no progress");
    manager.pause(&id).await;

    let paused = manager.get(&id).unwrap();
    assert_eq!(paused.status, DownloadStatus::Paused);
    assert!(paused.resume_token.is_some());

    manager.resume(&id).await;
    let done = timeout(
        Duration::from_secs(TEST_TIMEOUT_SECS),
        events.wait_for(|snap| {
            snap.get(&id)
                .is_some_and(|item| item.status == DownloadStatus::Completed)
        }),
    )
    .await
    .expect("never completed")
    .unwrap();

    let item = done.get(&id).unwrap();
    let expected: PathBuf = config.download_dir.join("42-1080p.mp4");
    assert_eq!(item.local_path, expected);
    assert_eq!(item.progress, 100.0);
    assert_eq!(std::fs::read(&expected).unwrap(), *state.body);
    assert!(state.last_range().is_some());
}
