// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download lifecycle for offline media
//!
//! This module tracks every download through
//! `downloading -> paused -> downloading -> completed | failed` with:
//! - Pause and resume backed by engine checkpoints
//! - State that survives restarts (interrupted downloads come back failed)
//! - Snapshot observers, by callback or async stream
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  commands   ┌─────────────────┐
//! │ DownloadManager │────────────▶│ Registry worker │
//! │ (cheap handle)  │             │ (owns items)    │
//! └────────┬────────┘             └──┬──────┬───────┘
//!          │ reads                   │      │ begin / pause / cancel
//!          ▼                         │      ▼
//! ┌─────────────────┐   publish      │  ┌─────────────────┐
//! │ SnapshotHub     │◀───────────────┤  │ TransferEngine  │
//! │ (observers)     │                │  │ (HTTP, tokio)   │
//! └─────────────────┘                │  └────────┬────────┘
//!                                    ▼           │ TransferSink events
//!                           ┌─────────────────┐  │ (same queue as
//!                           │ DownloadStore   │  │  commands)
//!                           │ (JSON file)     │◀─┘
//!                           └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use mediadl::config::load_config;
//! use mediadl::download::{DownloadManager, DownloadRequest};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = DownloadManager::from_config(load_config()?).await?;
//!
//! let request = DownloadRequest::movie("42", "Heat", "1080p", "https://cdn.example/42.mp4");
//! let id = request.id.clone();
//! manager.start(request).await;
//!
//! let mut events = manager.events();
//! let done = events
//!     .wait_for(|snap| snap.get(&id).is_some_and(|item| item.status.is_terminal()))
//!     .await;
//! println!("{:?}", done.and_then(|snap| snap.get(&id).map(|item| item.status)));
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod http;
pub mod manager;
pub mod observer;
pub mod state;
pub mod types;

// Re-export commonly used items
pub use engine::{
    partial_path, TransferControl, TransferEngine, TransferEvent, TransferEventKind,
    TransferHandle, TransferRequest, TransferSerial, TransferSignal, TransferSink,
};
pub use http::{Checkpoint, HttpTransferEngine};
pub use manager::{local_path_for, DownloadCommand, DownloadManager};
pub use observer::{Snapshot, SnapshotHub, SnapshotStream, Subscription};
pub use state::{DownloadStore, JsonFileStore, MemoryStore};
pub use types::{
    DownloadItem, DownloadRequest, DownloadStatus, MediaKind, ResumeToken, StatusCounts,
};
