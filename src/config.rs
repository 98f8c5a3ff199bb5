// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration for mediadl.
//!
//! Stored as JSON in `$MEDIADL_HOME/config.json` (default `~/.mediadl`).
//! Every field has a default, so a missing or partial file is fine.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "MEDIADL_HOME";

const CONFIG_FILE: &str = "config.json";

/// What `resume` does with a paused item's checkpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResumeMode {
    /// Hand the checkpoint to the engine and continue with a byte-range request.
    #[default]
    Checkpoint,
    /// Discard the checkpoint and fetch the whole file again.
    Restart,
}

/// HTTP transport settings for the transfer engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpConfig {
    pub user_agent: String,
    /// Connect timeout only; transfers themselves are not timed out.
    pub connect_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("mediadl/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Directory holding every downloaded file
    pub download_dir: PathBuf,
    /// JSON state file for the persistent store
    pub state_file: PathBuf,
    /// Extension given to downloaded files
    pub file_extension: String,
    pub resume_mode: ResumeMode,
    /// Minimum fraction increase between progress reports
    pub progress_step: f64,
    pub http: HttpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::rooted_at(&home_dir())
    }
}

impl Config {
    /// Defaults with every path placed under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            download_dir: root.join("downloads"),
            state_file: root.join("state.json"),
            file_extension: "mp4".to_string(),
            resume_mode: ResumeMode::default(),
            progress_step: 0.01,
            http: HttpConfig::default(),
        }
    }
}

/// The mediadl home directory: `$MEDIADL_HOME`, else `~/.mediadl`.
pub fn home_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(HOME_ENV) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .map(|h| h.join(".mediadl"))
        .unwrap_or_else(|| PathBuf::from(".mediadl"))
}

pub fn config_path() -> PathBuf {
    home_dir().join(CONFIG_FILE)
}

/// Load the config from the default location.
pub fn load_config() -> Result<Config> {
    load_config_from(&config_path())
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;
    let config: Config = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;
    Ok(config)
}
