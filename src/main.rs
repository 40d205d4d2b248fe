// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing_subscriber::EnvFilter;

use modelstash::{
    ArtifactError, ArtifactManager, ArtifactStatus, Config, ErrorKind, LifecycleEvent,
    TransferOutcome,
};

/// Environment variable holding the log filter.
const LOG_ENV: &str = "MODELSTASH_LOG";

// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const RED: &str = "\x1b[31m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const CYAN: &str = "\x1b[36m";
}

use colors::*;

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Usage error - unknown id or nothing to act on
    pub const USAGE: i32 = 64;
    /// Data error - checksum mismatch
    pub const DATA_ERR: i32 = 65;
    /// I/O error - network or file operation failed
    pub const IO_ERR: i32 = 74;
    /// Temporary failure - try again later
    pub const TEMP_FAIL: i32 = 75;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

#[derive(Parser)]
#[command(name = "modelstash", version, about = "Download, verify and select local model artifacts")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override the storage directory
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,

    /// Use a JSON manifest instead of the built-in catalog
    #[arg(long, global = true)]
    manifest: Option<PathBuf>,

    /// Verbose mode: debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Quiet mode: warnings only, no progress bar
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the catalog with local status
    ///
    /// Examples:
    ///   modelstash list
    ///   modelstash ls
    #[command(alias = "ls")]
    List,

    /// Show downloaded artifacts
    Downloaded,

    /// Download an artifact (Ctrl+C cancels)
    ///
    /// Examples:
    ///   modelstash download whisper-small
    Download {
        /// Catalog id
        id: String,
    },

    /// Delete a downloaded artifact
    ///
    /// Examples:
    ///   modelstash delete whisper-small
    ///   modelstash rm whisper-small --yes
    #[command(alias = "rm")]
    Delete {
        /// Catalog id
        id: String,
        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Resolve the active artifact path
    ///
    /// Examples:
    ///   modelstash active
    ///   modelstash active --select whisper-base
    Active {
        /// Select this id before resolving
        #[arg(long)]
        select: Option<String>,
    },

    /// Drop registry records whose files are gone
    Validate {
        /// Also re-hash every artifact against its recorded checksum
        #[arg(long)]
        checksums: bool,
    },
}

fn init_logging(verbose: bool, quiet: bool) {
    let default = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load().context("Failed to load configuration")?;
    if let Some(dir) = &cli.storage_dir {
        config.storage_dir = Some(dir.clone());
    }
    if let Some(manifest) = &cli.manifest {
        config.manifest_path = Some(manifest.clone());
    }
    Ok(config)
}

/// Human-readable byte count.
fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_073_741_824 {
        format!("{:.1} GB", bytes as f64 / 1_073_741_824.0)
    } else if bytes >= 1_048_576 {
        format!("{:.1} MB", bytes as f64 / 1_048_576.0)
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}

async fn list_available(manager: &ArtifactManager) -> Result<()> {
    println!();
    println!("{BOLD}Available artifacts{RESET}");
    println!();
    for item in manager.list_available().await {
        let status = match &item.status {
            ArtifactStatus::Downloaded => item.status.to_string().green(),
            ArtifactStatus::Downloading { .. } => item.status.to_string().yellow(),
            ArtifactStatus::Available => item.status.to_string().dimmed(),
        };
        println!(
            "  {:<26} {:<28} {:<14} {:>9}  {}",
            item.entry.id.cyan(),
            item.entry.name,
            item.entry.kind.to_string(),
            format_bytes(item.entry.declared_size_bytes),
            status
        );
    }
    println!();
    Ok(())
}

fn list_downloaded(manager: &ArtifactManager) -> Result<()> {
    let records = manager.list_downloaded();
    if records.is_empty() {
        println!("{YELLOW}[!]{RESET} Nothing downloaded yet. Try {CYAN}modelstash download <id>{RESET}");
        return Ok(());
    }
    println!();
    for record in records {
        println!(
            "  {:<26} {:>9}  {DIM}{}{RESET}",
            record.id.cyan(),
            format_bytes(record.actual_size_bytes),
            record.downloaded_at.format("%Y-%m-%d %H:%M UTC")
        );
        println!("    {DIM}{}{RESET}", record.local_path.display());
    }
    println!();
    Ok(())
}

fn progress_bar(total: u64, quiet: bool) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    if quiet || !atty::is(atty::Stream::Stderr) {
        pb.set_draw_target(ProgressDrawTarget::hidden());
    }
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} | {msg}")?
            .progress_chars("█▓░"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message("Connecting...");
    Ok(pb)
}

async fn download(manager: &ArtifactManager, id: &str, quiet: bool) -> Result<()> {
    let declared = manager
        .catalog()
        .get(id)
        .map(|entry| entry.declared_size_bytes)
        .unwrap_or(0);

    let mut events = manager.subscribe();
    let handle = manager.start_download(id).await?;
    let pb = progress_bar(declared, quiet)?;

    let wait = handle.wait();
    tokio::pin!(wait);
    let mut cancel_requested = false;

    let result = loop {
        tokio::select! {
            result = &mut wait => break result,
            Some(event) = events.recv() => {
                if let LifecycleEvent::Progress { id: event_id, state } = event {
                    if event_id == id {
                        pb.set_length(state.total_bytes.max(state.bytes_downloaded));
                        pb.set_position(state.bytes_downloaded);
                        let speed = state.speed_string().unwrap_or_default();
                        let eta = state.eta_string().map(|eta| format!(", {} left", eta));
                        pb.set_message(format!("{}%  {}{}", state.progress_percent, speed, eta.unwrap_or_default()));
                    }
                }
            }
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                pb.set_message("Cancelling...");
                if let Err(e) = manager.cancel_download(id) {
                    // Already verifying or registering; let it finish.
                    tracing::debug!("Cancel ignored: {}", e);
                }
            }
        }
    };

    match result {
        Ok(TransferOutcome::Completed(artifact)) => {
            pb.finish_and_clear();
            println!(
                "{GREEN}[OK]{RESET} Downloaded {} ({})",
                artifact.name,
                format_bytes(artifact.actual_size_bytes)
            );
            println!("     {DIM}{}{RESET}", artifact.local_path.display());
            Ok(())
        }
        Ok(TransferOutcome::Cancelled) => {
            pb.finish_and_clear();
            println!("{YELLOW}[!]{RESET} Download of {} cancelled; partial file removed", id);
            Ok(())
        }
        Err(e) => {
            pb.abandon();
            Err(e.into())
        }
    }
}

async fn delete(manager: &ArtifactManager, id: &str, yes: bool) -> Result<()> {
    if !yes {
        if !atty::is(atty::Stream::Stdin) {
            bail!("refusing to delete {} without --yes in a non-interactive session", id);
        }
        let confirmed = inquire::Confirm::new(&format!("Delete {} from disk?", id))
            .with_default(false)
            .prompt()
            .context("Confirmation prompt failed")?;
        if !confirmed {
            println!("{DIM}Nothing deleted.{RESET}");
            return Ok(());
        }
    }

    let removed = manager.delete_artifact(id).await?;
    println!(
        "{GREEN}[OK]{RESET} Deleted {} ({} freed)",
        removed.id,
        format_bytes(removed.actual_size_bytes)
    );
    Ok(())
}

async fn active(manager: &ArtifactManager, select: Option<String>) -> Result<()> {
    if let Some(id) = select {
        manager.set_selected(&id).await?;
    }
    match manager.resolve_active_path().await {
        Some(path) => {
            let id = manager.selected().unwrap_or_default();
            println!("{GREEN}[OK]{RESET} Active: {}", id.cyan());
            println!("     {}", path.display());
        }
        None => {
            println!("{YELLOW}[!]{RESET} No downloaded artifact available");
        }
    }
    Ok(())
}

async fn validate(manager: &ArtifactManager, checksums: bool) -> Result<()> {
    let report = manager.validate().await;
    for id in &report.removed {
        println!("{YELLOW}[!]{RESET} Removed stale record {}", id);
    }
    println!(
        "{GREEN}[OK]{RESET} {} valid, {} removed",
        report.valid.len(),
        report.removed.len()
    );

    if checksums {
        let mut corrupt = 0;
        for record in &report.valid {
            if manager.verify_artifact(&record.id).await? {
                println!("  {GREEN}✓{RESET} {}", record.id);
            } else {
                corrupt += 1;
                println!("  {RED}✗{RESET} {} does not match its checksum", record.id);
            }
        }
        if corrupt > 0 {
            bail!("{} artifact(s) failed checksum verification", corrupt);
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let manager = ArtifactManager::open(&config)
        .await
        .context("Failed to open artifact storage")?;

    match cli.command {
        Commands::List => list_available(&manager).await,
        Commands::Downloaded => list_downloaded(&manager),
        Commands::Download { id } => download(&manager, &id, cli.quiet).await,
        Commands::Delete { id, yes } => delete(&manager, &id, yes).await,
        Commands::Active { select } => active(&manager, select).await,
        Commands::Validate { checksums } => validate(&manager, checksums).await,
    }
}

fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<ArtifactError>().map(ArtifactError::kind) {
        Some(ErrorKind::NotFound | ErrorKind::NotDownloaded | ErrorKind::AlreadyDownloaded) => {
            exit_codes::USAGE
        }
        Some(ErrorKind::ChecksumMismatch) => exit_codes::DATA_ERR,
        Some(ErrorKind::DownloadError | ErrorKind::Storage | ErrorKind::AlreadyExists) => {
            exit_codes::IO_ERR
        }
        Some(ErrorKind::TransferInProgress) => exit_codes::TEMP_FAIL,
        Some(ErrorKind::Config) => exit_codes::CONFIG,
        None => exit_codes::ERROR,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    if let Err(err) = run(cli).await {
        eprintln!("{RED}[X]{RESET} {:#}", err);
        if let Some(hint) = err.downcast_ref::<ArtifactError>().and_then(ArtifactError::hint) {
            eprintln!("    {DIM}{}{RESET}", hint);
        }
        std::process::exit(exit_code(&err));
    }
}
