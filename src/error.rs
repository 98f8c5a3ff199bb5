// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types and user-facing error formatting.
//!
//! Registry commands never fail towards their caller; what can fail is a
//! single transfer (reported as [`TransferError`] and surfaced as a `failed`
//! item) and the CLI's own setup, which prints through [`format_error`].

use std::fmt;

/// Trailer appended to every formatted error.
pub const HELP_HINT: &str = "Re-run with --verbose to see the full log.";

/// Why a single transfer failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Server answered with a non-success status.
    Http { status: u16 },
    /// Connection or body stream error.
    Network(String),
    /// Writing the destination file failed.
    Io(String),
    /// The resume token could not be decoded.
    InvalidCheckpoint(String),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http { status } => write!(f, "server responded with HTTP {}", status),
            Self::Network(msg) => write!(f, "network error: {}", msg),
            Self::Io(msg) => write!(f, "write error: {}", msg),
            Self::InvalidCheckpoint(msg) => write!(f, "invalid resume checkpoint: {}", msg),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Self::Http { status: status.as_u16() },
            None => Self::Network(e.to_string()),
        }
    }
}

/// Formats an error message with title, causes, fixes, and a help hint.
///
/// # Example
///
/// ```
/// use mediadl::error::format_error;
///
/// let error = format_error(
///     "Download failed",
///     &["The server is unreachable", "The disk is full"],
///     &["Retry later: mediadl retry 42-1080p"],
/// );
/// println!("{}", error);
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = format!("[✗] {}\n\n", title);

    if !causes.is_empty() {
        output.push_str("Possible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
        output.push('\n');
    }

    if !fixes.is_empty() {
        output.push_str("Try these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
        output.push('\n');
    }

    output.push_str(HELP_HINT);
    output
}

/// Builder for [`format_error`] messages assembled piecemeal.
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    pub fn build(&self) -> String {
        let causes: Vec<&str> = self.causes.iter().map(|s| s.as_str()).collect();
        let fixes: Vec<&str> = self.fixes.iter().map(|s| s.as_str()).collect();
        format_error(&self.title, &causes, &fixes)
    }
}

impl fmt::Display for ErrorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.build())
    }
}
