// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent state for downloads.
//!
//! The registry saves its whole collection after every durable transition
//! so that a restarted process sees the same items. [`JsonFileStore`] keeps
//! the collection under one well-known key of a JSON object file; other keys
//! in that file belong to someone else and are carried over untouched.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde_json::{Map, Value};

use super::types::DownloadItem;
use crate::locks::resilient_lock;

/// Key under which the collection is stored.
pub const DOWNLOADS_KEY: &str = "downloads";

/// Default timeout for acquiring file locks (5 seconds)
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry interval when waiting for lock acquisition
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Durable record of all download metadata.
pub trait DownloadStore: Send + Sync {
    /// Load the persisted collection, in order. Nothing persisted yet is an
    /// empty collection, not an error.
    fn load(&self) -> Result<Vec<DownloadItem>>;

    /// Replace the persisted collection.
    fn save(&self, items: &[DownloadItem]) -> Result<()>;
}

/// JSON file store with file locking and atomic replace.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    lock_timeout: Duration,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sibling `.lock` file coordinating access to the state file.
    ///
    /// A separate file lets the lock be held across the atomic rename.
    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn open_lock_file(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory for lock file: {:?}", parent))?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {:?}", path))
    }

    /// Acquire an exclusive lock, retrying until `timeout`.
    fn acquire_exclusive_lock_with_timeout(path: &Path, timeout: Duration) -> Result<File> {
        let lock_file = Self::open_lock_file(path)?;
        let start = Instant::now();

        loop {
            match FileExt::try_lock_exclusive(&lock_file) {
                Ok(()) => return Ok(lock_file),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!(
                            "Timed out waiting for exclusive lock on {:?} after {:?}. \
                             Another mediadl process may be writing the state file.",
                            path,
                            timeout
                        );
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to acquire exclusive lock on {:?}", path));
                }
            }
        }
    }

    /// Acquire a shared lock, retrying until `timeout`.
    fn acquire_shared_lock_with_timeout(file: &File, timeout: Duration) -> Result<()> {
        let start = Instant::now();

        loop {
            match FileExt::try_lock_shared(file) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        bail!("Timed out waiting for shared lock after {:?}", timeout);
                    }
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(e).with_context(|| "Failed to acquire shared lock on state file");
                }
            }
        }
    }

    /// Read the whole namespace object. Caller holds a lock.
    fn read_namespace(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file: {:?}", self.path))?;
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        let value: Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {:?}", self.path))?;
        match value {
            Value::Object(map) => Ok(map),
            _ => bail!("State file {:?} is not a JSON object", self.path),
        }
    }

    fn write_atomically(&self, content: &str) -> Result<()> {
        let temp_path = self.path.with_extension("tmp");
        {
            let mut temp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
            temp_file
                .write_all(content.as_bytes())
                .with_context(|| "Failed to write to temp file")?;
            temp_file
                .sync_all()
                .with_context(|| "Failed to sync temp file to disk")?;
        }
        fs::rename(&temp_path, &self.path).with_context(|| {
            format!("Failed to rename temp file to state file: {:?} -> {:?}", temp_path, self.path)
        })
    }
}

impl DownloadStore for JsonFileStore {
    fn load(&self) -> Result<Vec<DownloadItem>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let lock_file = Self::open_lock_file(&self.lock_path())?;
        Self::acquire_shared_lock_with_timeout(&lock_file, self.lock_timeout)?;

        let mut namespace = self.read_namespace()?;
        match namespace.remove(DOWNLOADS_KEY) {
            Some(value) => serde_json::from_value(value)
                .with_context(|| format!("Failed to parse `{}` in {:?}", DOWNLOADS_KEY, self.path)),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, items: &[DownloadItem]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let _lock_guard =
            Self::acquire_exclusive_lock_with_timeout(&self.lock_path(), self.lock_timeout)?;

        let mut namespace = match self.read_namespace() {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!("Discarding unreadable state file {:?}: {:#}", self.path, e);
                Map::new()
            }
        };
        namespace.insert(
            DOWNLOADS_KEY.to_string(),
            serde_json::to_value(items).with_context(|| "Failed to serialize downloads")?,
        );

        let content = serde_json::to_string_pretty(&Value::Object(namespace))
            .with_context(|| "Failed to serialize state to JSON")?;
        self.write_atomically(&content)
    }
}

/// In-process store for tests and embedders that do not need durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<Vec<DownloadItem>>,
    fail_writes: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that loads `items` on first use.
    pub fn seeded(items: Vec<DownloadItem>) -> Self {
        Self {
            items: Mutex::new(items),
            ..Self::default()
        }
    }

    /// Make subsequent saves fail, to exercise persistence-error handling.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// What the last successful save wrote.
    pub fn persisted(&self) -> Vec<DownloadItem> {
        resilient_lock(&self.items).clone()
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl DownloadStore for MemoryStore {
    fn load(&self) -> Result<Vec<DownloadItem>> {
        Ok(resilient_lock(&self.items).clone())
    }

    fn save(&self, items: &[DownloadItem]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("memory store is read-only");
        }
        *resilient_lock(&self.items) = items.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
