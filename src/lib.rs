// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! mediadl - download lifecycle manager for offline media
//!
//! Start, pause, resume, retry and delete downloads; state survives
//! restarts and every change is published to observers.
//!
//! # Core Modules
//!
//! - [`download`] - Registry state machine, transfer engines, persistence, observers
//! - [`config`] - JSON configuration under `$MEDIADL_HOME`
//! - [`error`] - Transfer errors and consistent error formatting
//! - [`locks`] - Poison-tolerant lock helpers

pub mod config;
pub mod download;
pub mod error;
pub mod locks;

// Re-export commonly used types
pub use config::{load_config, Config, ResumeMode};
pub use download::{
    DownloadItem, DownloadManager, DownloadRequest, DownloadStatus, MediaKind, Snapshot,
    StatusCounts, Subscription,
};
pub use error::{format_error, ErrorBuilder, TransferError};
