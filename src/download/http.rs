// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! HTTP transfer engine.
//!
//! Streams the response body into `<destination>.part` and renames it into
//! place once the last byte is written. Pausing flushes the part file and
//! yields a checkpoint; resuming from that checkpoint asks the server for
//! the remaining byte range and falls back to a full download when the
//! server will not honour it.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_RANGE, ETAG, IF_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::engine::{
    partial_path, TransferControl, TransferEngine, TransferRequest, TransferSignal, TransferSink,
};
use super::types::ResumeToken;
use crate::config::Config;
use crate::error::TransferError;

/// What an HTTP resume token decodes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub url: String,
    /// Bytes already in the part file
    pub bytes: u64,
    pub total: Option<u64>,
    pub etag: Option<String>,
}

impl Checkpoint {
    pub fn encode(&self) -> Result<ResumeToken, TransferError> {
        serde_json::to_string(self)
            .map(ResumeToken::new)
            .map_err(|e| TransferError::InvalidCheckpoint(e.to_string()))
    }

    pub fn decode(token: &ResumeToken) -> Result<Self, TransferError> {
        serde_json::from_str(token.as_str())
            .map_err(|e| TransferError::InvalidCheckpoint(e.to_string()))
    }
}

enum Outcome {
    Completed(PathBuf),
    Paused(Checkpoint),
    Cancelled,
}

/// [`TransferEngine`] over reqwest. One tokio task per transfer.
#[derive(Debug, Clone)]
pub struct HttpTransferEngine {
    client: Client,
    progress_step: f64,
}

impl HttpTransferEngine {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.http.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.http.connect_timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self::with_client(client, config.progress_step))
    }

    pub fn with_client(client: Client, progress_step: f64) -> Self {
        Self {
            client,
            progress_step: progress_step.clamp(0.0, 1.0),
        }
    }
}

impl TransferEngine for HttpTransferEngine {
    fn begin(&self, request: TransferRequest, sink: TransferSink, control: TransferControl) {
        let client = self.client.clone();
        let step = self.progress_step;
        tokio::spawn(run_transfer(client, request, sink, control, step));
    }
}

async fn run_transfer(
    client: Client,
    request: TransferRequest,
    mut sink: TransferSink,
    mut control: TransferControl,
    step: f64,
) {
    let part = partial_path(&request.destination);

    match transfer(&client, &request, &part, &mut sink, &mut control, step).await {
        Ok(Outcome::Completed(path)) => {
            tracing::debug!(id = %request.id, "Transfer complete: {:?}", path);
            sink.complete(path);
        }
        Ok(Outcome::Paused(checkpoint)) => match checkpoint.encode() {
            Ok(token) => {
                tracing::debug!(id = %request.id, bytes = checkpoint.bytes, "Transfer paused");
                control.checkpoint(token);
                sink.detach();
            }
            Err(e) => sink.fail(e),
        },
        Ok(Outcome::Cancelled) => {
            tracing::debug!(id = %request.id, "Transfer cancelled");
            if let Err(e) = fs::remove_file(&part).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove partial file {:?}: {}", part, e);
                }
            }
            sink.detach();
        }
        Err(e) => {
            tracing::warn!(id = %request.id, "Transfer failed: {}", e);
            sink.fail(e);
        }
    }
}

fn interrupted_outcome(signal: TransferSignal, checkpoint: Checkpoint) -> Outcome {
    match signal {
        TransferSignal::Pause => Outcome::Paused(checkpoint),
        TransferSignal::Cancel | TransferSignal::Run => Outcome::Cancelled,
    }
}

/// Checkpoint we may continue from, if the token matches what is on disk.
async fn usable_checkpoint(request: &TransferRequest, part: &Path) -> Option<Checkpoint> {
    let token = request.resume_from.as_ref()?;
    let checkpoint = match Checkpoint::decode(token) {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            tracing::debug!(id = %request.id, "Ignoring resume token: {}", e);
            return None;
        }
    };
    if checkpoint.url != request.url || checkpoint.bytes == 0 {
        return None;
    }
    let on_disk = fs::metadata(part).await.ok()?.len();
    if on_disk < checkpoint.bytes {
        tracing::debug!(
            id = %request.id,
            on_disk,
            expected = checkpoint.bytes,
            "Partial file shorter than checkpoint; starting over"
        );
        return None;
    }
    Some(checkpoint)
}

/// First byte of a `Content-Range: bytes <first>-<last>/<total>` header.
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (first, _) = value.trim().strip_prefix("bytes ")?.split_once('-')?;
    first.trim().parse().ok()
}

async fn send(
    client: &Client,
    url: &str,
    offset: u64,
    etag: Option<&str>,
) -> Result<Response, TransferError> {
    let mut builder = client.get(url);
    if offset > 0 {
        builder = builder.header(RANGE, format!("bytes={}-", offset));
        // If-Range only accepts strong validators.
        if let Some(etag) = etag.filter(|e| !e.starts_with("W/")) {
            builder = builder.header(IF_RANGE, etag);
        }
    }
    Ok(builder.send().await?)
}

async fn transfer(
    client: &Client,
    request: &TransferRequest,
    part: &Path,
    sink: &mut TransferSink,
    control: &mut TransferControl,
    step: f64,
) -> Result<Outcome, TransferError> {
    if let Some(parent) = part.parent() {
        fs::create_dir_all(parent).await?;
    }

    let resume = usable_checkpoint(request, part).await;
    let mut offset = resume.as_ref().map(|c| c.bytes).unwrap_or(0);
    let etag = resume.as_ref().and_then(|c| c.etag.clone());
    let before_request = Checkpoint {
        url: request.url.clone(),
        bytes: offset,
        total: resume.as_ref().and_then(|c| c.total),
        etag: etag.clone(),
    };

    let mut response = tokio::select! {
        biased;
        signal = control.interrupted() => return Ok(interrupted_outcome(signal, before_request.clone())),
        response = send(client, &request.url, offset, etag.as_deref()) => response?,
    };

    if offset > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
        tracing::debug!(id = %request.id, "Server rejected range; restarting from zero");
        offset = 0;
        response = tokio::select! {
            biased;
            signal = control.interrupted() => return Ok(interrupted_outcome(signal, before_request.clone())),
            response = send(client, &request.url, 0, None) => response?,
        };
    }

    // Appending any other range would corrupt the part file.
    if offset > 0
        && response.status() == StatusCode::PARTIAL_CONTENT
        && content_range_start(response.headers()) != Some(offset)
    {
        tracing::debug!(id = %request.id, offset, "Server sent a different range; restarting from zero");
        offset = 0;
        response = tokio::select! {
            biased;
            signal = control.interrupted() => return Ok(interrupted_outcome(signal, before_request.clone())),
            response = send(client, &request.url, 0, None) => response?,
        };
    }

    let status = response.status();
    if !status.is_success() {
        return Err(TransferError::Http {
            status: status.as_u16(),
        });
    }

    let append = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
    if !append {
        offset = 0;
    }

    let etag = response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let total = response.content_length().map(|len| len + offset);

    let mut file = if append {
        let mut file = OpenOptions::new().write(true).open(part).await?;
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file
    } else {
        File::create(part).await?
    };

    let mut written = offset;
    let fraction = |written: u64| match total {
        Some(total) if total > 0 => written as f64 / total as f64,
        _ => 0.0,
    };
    sink.progress(fraction(written));
    let mut last_reported = sink.last_fraction();

    let mut stream = response.bytes_stream();
    loop {
        tokio::select! {
            biased;
            signal = control.interrupted() => {
                file.flush().await?;
                file.sync_all().await?;
                let checkpoint = Checkpoint {
                    url: request.url.clone(),
                    bytes: written,
                    total,
                    etag: etag.clone(),
                };
                return Ok(interrupted_outcome(signal, checkpoint));
            }
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    file.write_all(&bytes).await?;
                    written += bytes.len() as u64;
                    let now = fraction(written);
                    if now - last_reported >= step || now >= 1.0 {
                        sink.progress(now);
                        last_reported = sink.last_fraction();
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let Some(total) = total {
        if written < total {
            return Err(TransferError::Network(format!(
                "connection closed after {} of {} bytes",
                written, total
            )));
        }
    }

    fs::rename(part, &request.destination).await?;
    sink.progress(1.0);
    Ok(Outcome::Completed(request.destination.clone()))
}
