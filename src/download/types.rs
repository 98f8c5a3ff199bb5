// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types shared by the registry, the store and the transfer engine.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a download item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// A transfer is running
    Downloading,
    /// Suspended by the user, resumable from `resume_token`
    Paused,
    /// File is fully written to `local_path`
    Completed,
    /// Transfer failed or went stale across a restart
    Failed,
}

impl DownloadStatus {
    /// Returns true if no further automatic transition will happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Failed)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Paused => "paused",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What kind of media an item is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MediaKind {
    #[default]
    Movie,
    SeriesEpisode,
}

/// Opaque engine checkpoint, present only while an item is paused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The caller-supplied part of a download: what to fetch and how to label it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    /// Unique identifier, see [`DownloadRequest::derive_id`]
    pub id: String,
    /// Grouping key shared by every variant/episode of one title
    pub content_id: String,
    pub title: String,
    #[serde(default)]
    pub poster_url: Option<String>,
    #[serde(default)]
    pub media_kind: MediaKind,
    #[serde(default)]
    pub season: Option<u32>,
    #[serde(default)]
    pub episode: Option<u32>,
    #[serde(default)]
    pub quality: String,
    /// Human-readable size as shown by the catalog (e.g. "1.4 GB")
    #[serde(default)]
    pub size: String,
    /// Source URL
    pub remote_url: String,
}

impl DownloadRequest {
    /// Create a movie request; the id is derived from content id and quality.
    pub fn movie(
        content_id: impl Into<String>,
        title: impl Into<String>,
        quality: impl Into<String>,
        remote_url: impl Into<String>,
    ) -> Self {
        let mut request = Self {
            id: String::new(),
            content_id: content_id.into(),
            title: title.into(),
            poster_url: None,
            media_kind: MediaKind::Movie,
            season: None,
            episode: None,
            quality: quality.into(),
            size: String::new(),
            remote_url: remote_url.into(),
        };
        request.id = request.derive_id();
        request
    }

    /// Create a series episode request; the id includes season and episode.
    pub fn episode(
        content_id: impl Into<String>,
        title: impl Into<String>,
        season: u32,
        episode: u32,
        quality: impl Into<String>,
        remote_url: impl Into<String>,
    ) -> Self {
        let mut request = Self::movie(content_id, title, quality, remote_url);
        request.media_kind = MediaKind::SeriesEpisode;
        request.season = Some(season);
        request.episode = Some(episode);
        request.id = request.derive_id();
        request
    }

    /// Identifier convention: `content-quality`, or `content-sXeY-quality`
    /// for episodes.
    pub fn derive_id(&self) -> String {
        match (self.media_kind, self.season, self.episode) {
            (MediaKind::SeriesEpisode, Some(season), Some(episode)) => {
                format!("{}-s{}e{}-{}", self.content_id, season, episode, self.quality)
            }
            _ => format!("{}-{}", self.content_id, self.quality),
        }
    }

    pub fn with_poster(mut self, poster_url: impl Into<String>) -> Self {
        self.poster_url = Some(poster_url.into());
        self
    }

    pub fn with_size(mut self, size: impl Into<String>) -> Self {
        self.size = size.into();
        self
    }
}

/// One requested transfer as tracked by the registry.
///
/// Field names serialize in camelCase; this is the persisted record format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadItem {
    pub id: String,
    pub content_id: String,
    pub title: String,
    #[serde(default)]
    pub poster_url: Option<String>,
    #[serde(default)]
    pub media_kind: MediaKind,
    #[serde(default)]
    pub season: Option<u32>,
    #[serde(default)]
    pub episode: Option<u32>,
    #[serde(default)]
    pub quality: String,
    #[serde(default)]
    pub size: String,
    pub remote_url: String,
    /// Destination file, assigned by the registry
    pub local_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<ResumeToken>,
    pub status: DownloadStatus,
    /// Percent complete, 0..=100
    #[serde(default)]
    pub progress: f64,
    pub created_at: DateTime<Utc>,
}

impl DownloadItem {
    /// Build a fresh `downloading` item for a request.
    pub fn from_request(request: DownloadRequest, local_path: PathBuf) -> Self {
        Self {
            id: request.id,
            content_id: request.content_id,
            title: request.title,
            poster_url: request.poster_url,
            media_kind: request.media_kind,
            season: request.season,
            episode: request.episode,
            quality: request.quality,
            size: request.size,
            remote_url: request.remote_url,
            local_path,
            resume_token: None,
            status: DownloadStatus::Downloading,
            progress: 0.0,
            created_at: Utc::now(),
        }
    }

    /// The request fields this item was started with, used by retry.
    pub fn to_request(&self) -> DownloadRequest {
        DownloadRequest {
            id: self.id.clone(),
            content_id: self.content_id.clone(),
            title: self.title.clone(),
            poster_url: self.poster_url.clone(),
            media_kind: self.media_kind,
            season: self.season,
            episode: self.episode,
            quality: self.quality.clone(),
            size: self.size.clone(),
            remote_url: self.remote_url.clone(),
        }
    }

    /// Short label for logs and the CLI, e.g. "Show S1E2 (1080p)".
    pub fn label(&self) -> String {
        match (self.season, self.episode) {
            (Some(s), Some(e)) => format!("{} S{}E{} ({})", self.title, s, e, self.quality),
            _ if self.quality.is_empty() => self.title.clone(),
            _ => format!("{} ({})", self.title, self.quality),
        }
    }
}

/// Tally of items per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub downloading: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn tally<'a>(items: impl IntoIterator<Item = &'a DownloadItem>) -> Self {
        let mut counts = Self::default();
        for item in items {
            match item.status {
                DownloadStatus::Downloading => counts.downloading += 1,
                DownloadStatus::Paused => counts.paused += 1,
                DownloadStatus::Completed => counts.completed += 1,
                DownloadStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.downloading + self.paused + self.completed + self.failed
    }
}
