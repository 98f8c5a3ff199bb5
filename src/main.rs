// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use mediadl::config::{config_path, load_config, Config};
use mediadl::download::{DownloadItem, DownloadManager, DownloadRequest, DownloadStatus};
use mediadl::error::{format_error, ErrorBuilder, HELP_HINT};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Success - operation completed successfully
    pub const SUCCESS: i32 = 0;
    /// General error - the download failed
    pub const ERROR: i32 = 1;
    /// Usage error - unknown id or wrong state for the command
    pub const USAGE: i32 = 64;
    /// Temporary failure - interrupted, resumable later
    pub const TEMP_FAIL: i32 = 75;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

use exit_codes::*;

/// mediadl - download movies and episodes for offline viewing.
#[derive(Parser)]
#[command(name = "mediadl")]
#[command(version = VERSION)]
#[command(about = "Download lifecycle manager for offline media.")]
#[command(long_about = "mediadl - download lifecycle manager for offline media\n\n\
    Download a movie:    mediadl get <url> --content-id 42 --title \"Heat\" --quality 1080p\n\
    Resume after Ctrl-C: mediadl resume 42-1080p\n\
    See what you have:   mediadl list\n\n\
    Ctrl-C pauses the running download; state is kept in $MEDIADL_HOME.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose mode: debug logging on stderr
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a download and follow it until it finishes
    ///
    /// Examples:
    ///   mediadl get https://cdn.example/heat.mp4 --content-id 42 --title Heat
    ///   mediadl get https://cdn.example/s1e2.mp4 --content-id 7 --title Show -s 1 -e 2
    Get {
        /// Source URL
        url: String,
        /// Catalog id shared by every quality/episode of the title
        #[arg(long)]
        content_id: String,
        #[arg(long)]
        title: String,
        #[arg(short, long, default_value = "hd")]
        quality: String,
        /// Season number (episodes only)
        #[arg(short, long, requires = "episode")]
        season: Option<u32>,
        /// Episode number (episodes only)
        #[arg(short, long, requires = "season")]
        episode: Option<u32>,
        /// Use this id instead of the derived one
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        poster: Option<String>,
        /// Human-readable size shown in listings, e.g. "1.4 GB"
        #[arg(long)]
        size: Option<String>,
    },

    /// Resume a paused download and follow it
    Resume { id: String },

    /// Restart a failed download and follow it
    Retry { id: String },

    /// List every download
    #[command(alias = "ls")]
    List {
        /// Print the raw records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show counts per status and where files are kept, or one title's state
    #[command(alias = "s")]
    Status {
        /// Catalog id to look up
        content_id: Option<String>,
    },

    /// Delete a download and its file
    #[command(alias = "rm")]
    Delete { id: String },

    /// Delete every download and empty the download directory
    Clear {
        /// Required; there is no undo
        #[arg(long)]
        yes: bool,
    },
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "{}",
                format_error(
                    "Could not load configuration",
                    &[&format!("{:#}", e)],
                    &[&format!("Fix or remove {}", config_path().display())],
                )
            );
            std::process::exit(CONFIG);
        }
    };

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let code = runtime.block_on(run(cli.command, config))?;
    std::process::exit(code);
}

async fn run(command: Commands, config: Config) -> Result<i32> {
    let manager = DownloadManager::from_config(config.clone()).await?;

    let code = match command {
        Commands::Get {
            url,
            content_id,
            title,
            quality,
            season,
            episode,
            id,
            poster,
            size,
        } => {
            let mut request = match (season, episode) {
                (Some(s), Some(e)) => DownloadRequest::episode(content_id, title, s, e, quality, url),
                _ => DownloadRequest::movie(content_id, title, quality, url),
            };
            if let Some(poster) = poster {
                request = request.with_poster(poster);
            }
            if let Some(size) = size {
                request = request.with_size(size);
            }
            if let Some(id) = id {
                request.id = id;
            }

            let id = request.id.clone();
            if let Some(existing) = manager.get(&id) {
                if existing.status == DownloadStatus::Completed {
                    println!(
                        "{} Already downloaded: {}",
                        "[OK]".green(),
                        existing.local_path.display()
                    );
                    manager.shutdown().await;
                    return Ok(SUCCESS);
                }
            }

            manager.start(request).await;
            follow(&manager, &id).await
        }
        Commands::Resume { id } => match manager.get(&id) {
            Some(item) if item.status == DownloadStatus::Paused => {
                manager.resume(&id).await;
                follow(&manager, &id).await
            }
            Some(item) => wrong_state(&item, "resume", "paused"),
            None => unknown_id(&id),
        },
        Commands::Retry { id } => match manager.get(&id) {
            Some(item) if item.status == DownloadStatus::Failed => {
                manager.retry(&id).await;
                follow(&manager, &id).await
            }
            Some(item) => wrong_state(&item, "retry", "failed"),
            None => unknown_id(&id),
        },
        Commands::List { json } => {
            let items = manager.get_all();
            if json {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else {
                print_list(&items);
            }
            SUCCESS
        }
        Commands::Status { content_id: None } => {
            print_status(&manager, &config);
            SUCCESS
        }
        Commands::Status {
            content_id: Some(content_id),
        } => match manager.status_of(&content_id) {
            Some(item) => {
                let downloaded = if manager.is_completed(&content_id) {
                    "yes".green()
                } else {
                    "no".bright_black()
                };
                println!("{} {}", "Downloaded:".bright_black(), downloaded);
                print_list(&[item]);
                SUCCESS
            }
            None => {
                println!("{}", format!("Nothing downloaded for '{}'.", content_id).bright_black());
                USAGE
            }
        },
        Commands::Delete { id } => {
            if manager.get(&id).is_none() {
                unknown_id(&id)
            } else {
                manager.delete(&id).await;
                println!("{} Deleted {}", "[OK]".green(), id.bright_white());
                SUCCESS
            }
        }
        Commands::Clear { yes } => {
            if !yes {
                eprintln!(
                    "{} This deletes every download. Re-run with {} to confirm.",
                    "[!]".yellow(),
                    "--yes".bright_cyan()
                );
                USAGE
            } else {
                let removed = manager.counts().total();
                manager.clear_all().await;
                println!("{} Removed {} download(s)", "[OK]".green(), removed);
                SUCCESS
            }
        }
    };

    manager.shutdown().await;
    Ok(code)
}

fn progress_bar(label: &str) -> ProgressBar {
    let bar = ProgressBar::new(100);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.cyan} {msg} [{bar:30.cyan/blue}] {pos:>3}%")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    bar.set_style(style);
    bar.set_message(label.to_string());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

/// Follow one item until it leaves `downloading`. Ctrl-C pauses it.
async fn follow(manager: &DownloadManager, id: &str) -> i32 {
    let label = manager
        .get(id)
        .map(|item| item.label())
        .unwrap_or_else(|| id.to_string());
    let bar = progress_bar(&label);
    let mut events = manager.events();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                bar.finish_and_clear();
                manager.shutdown().await;
                println!(
                    "{} Paused. Continue with: {}",
                    "[!]".yellow(),
                    format!("mediadl resume {}", id).bright_cyan()
                );
                return TEMP_FAIL;
            }
            snapshot = events.recv() => {
                let Some(snapshot) = snapshot else {
                    bar.finish_and_clear();
                    return ERROR;
                };
                let Some(item) = snapshot.get(id) else {
                    bar.finish_and_clear();
                    eprintln!("{} {} was removed", "[!]".yellow(), id);
                    return ERROR;
                };
                bar.set_position(item.progress.round() as u64);
                match item.status {
                    DownloadStatus::Downloading => {}
                    DownloadStatus::Completed => {
                        bar.finish_and_clear();
                        println!(
                            "{} {} -> {}",
                            "[OK]".green(),
                            item.label().bright_white().bold(),
                            item.local_path.display()
                        );
                        return SUCCESS;
                    }
                    DownloadStatus::Paused => {
                        bar.finish_and_clear();
                        println!("{} {} paused", "[!]".yellow(), item.label());
                        return TEMP_FAIL;
                    }
                    DownloadStatus::Failed => {
                        bar.finish_and_clear();
                        let message = ErrorBuilder::new(format!("Download failed: {}", item.label()))
                            .cause("The server refused the request or the connection dropped")
                            .fix(format!("Try again with: mediadl retry {}", id))
                            .fix(HELP_HINT)
                            .build();
                        eprintln!("{}", message);
                        return ERROR;
                    }
                }
            }
        }
    }
}

fn unknown_id(id: &str) -> i32 {
    eprintln!(
        "{}",
        format_error(
            &format!("No download with id '{}'", id),
            &[],
            &["List known ids with: mediadl list"],
        )
    );
    USAGE
}

fn wrong_state(item: &DownloadItem, action: &str, expected: &str) -> i32 {
    eprintln!(
        "{} Cannot {} {}: it is {}, not {}",
        "[!]".yellow(),
        action,
        item.id.bright_white(),
        item.status,
        expected
    );
    USAGE
}

fn status_label(status: DownloadStatus) -> colored::ColoredString {
    let text = format!("{:<11}", status.to_string());
    match status {
        DownloadStatus::Downloading => text.cyan(),
        DownloadStatus::Paused => text.yellow(),
        DownloadStatus::Completed => text.green(),
        DownloadStatus::Failed => text.red(),
    }
}

fn print_list(items: &[DownloadItem]) {
    if items.is_empty() {
        println!("{}", "No downloads.".bright_black());
        return;
    }
    for item in items {
        let size = if item.size.is_empty() {
            String::new()
        } else {
            format!(" {}", item.size.bright_black())
        };
        println!(
            "{} {:>5.1}%  {}  {}{}",
            status_label(item.status),
            item.progress,
            item.id.bright_white(),
            item.label(),
            size
        );
    }
}

fn print_status(manager: &DownloadManager, config: &Config) {
    let counts = manager.counts();
    println!("{}", "mediadl".bright_cyan().bold());
    println!("  {} {}", "Downloading:".bright_black(), counts.downloading);
    println!("  {} {}", "Paused:     ".bright_black(), counts.paused);
    println!("  {} {}", "Completed:  ".bright_black(), counts.completed);
    println!("  {} {}", "Failed:     ".bright_black(), counts.failed);
    println!();
    println!("  {} {}", "Files:      ".bright_black(), config.download_dir.display());
    println!("  {} {}", "State:      ".bright_black(), config.state_file.display());
    println!("  {} {}", "Config:     ".bright_black(), config_path().display());
}
