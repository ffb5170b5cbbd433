//! rust-torrent-client - Main entry point
//!
//! Downloads one torrent from its swarm, with optional resume support.

use anyhow::{Context, Result};
use rust_torrent_client::cli::progress::format_bytes;
use rust_torrent_client::{
    CliArgs, Config, DiskFileStore, ProgressDisplay, TorrentError, TorrentMetadata,
    TorrentParser, Transfer,
};
use rust_torrent_client::transfer::stop_on_signal;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    info!("rust-torrent-client starting");
    debug!("CLI arguments: {:?}", args);

    let metadata = load_torrent_file(&args.torrent_file)
        .context("Failed to load torrent file")?;

    let config = Config::from_args(&args, metadata);
    config.validate()
        .context("Invalid configuration")?;

    display_torrent_info(&config.metadata, &config);

    let store = Arc::new(DiskFileStore::new(config.output_dir.clone()));
    let transfer = Transfer::new(config.metadata.clone(), store, config.transfer_config())
        .context("Failed to set up transfer")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(stop_on_signal(tokio::signal::ctrl_c(), shutdown_tx));

    let progress = ProgressDisplay::new(config.is_quiet());
    progress.print_status("Starting download...")?;
    let display = tokio::spawn(ProgressDisplay::new(config.is_quiet()).follow(transfer.subscribe()));

    let result = transfer.run(shutdown_rx).await;
    display.abort();

    match result {
        Ok(stats) if stats.is_complete() => {
            info!("Download completed successfully");
            progress.print_complete(&stats)?;
        }
        Ok(stats) => {
            info!("Download stopped before completion");
            progress.print_summary(&stats)?;
        }
        Err(e) => {
            error!("Download failed: {}", e);
            progress.print_error(&format!("Download failed: {}", e))?;
            return Err(e);
        }
    }

    info!("rust-torrent-client finished");
    Ok(())
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }

    debug!("Logging initialized at {:?}", args.log_level());
}

/// Load and parse the torrent file
fn load_torrent_file(path: &Path) -> Result<TorrentMetadata> {
    info!("Loading torrent file: {}", path.display());

    let torrent_data = std::fs::read(path).map_err(|e| {
        error!("Failed to read torrent file '{}': {}", path.display(), e);
        TorrentError::parse_error_with_source(format!("Failed to read {}", path.display()), e.to_string())
    })?;

    debug!("Torrent file size: {} bytes", torrent_data.len());

    let metadata = TorrentParser::parse_bytes(&torrent_data).map_err(|e| {
        error!("Failed to parse torrent file '{}': {}", path.display(), e);
        e
    })?;

    info!("Successfully loaded torrent file: {}", metadata.name);
    Ok(metadata)
}

/// Display torrent information
fn display_torrent_info(metadata: &TorrentMetadata, config: &Config) {
    if config.is_quiet() {
        return;
    }

    println!("Torrent Information:");
    println!("  Name: {}", metadata.name);
    println!("  Size: {} ({})", metadata.total_length(), format_bytes(metadata.total_length()));
    println!("  Files: {}", metadata.files.len());
    println!("  Pieces: {}", metadata.piece_count());
    println!("  Piece length: {}", format_bytes(metadata.piece_length));
    println!("  Info hash: {}", metadata.info_hash_hex());
    println!();
    println!("Configuration:");
    println!("  Output directory: {}", config.output_dir.display());
    println!("  Announce port: {}", config.port);
    println!("  Max peers: {}", config.max_peers);
    println!("  File workers: {}", config.file_workers);
    println!("  Task budget: {}", format_bytes(config.task_budget));
    println!("  Tracker: {}", if config.is_tracker_enabled() { "enabled" } else { "disabled" });
    println!("  Static peers: {}", config.peers.len());
    match config.resume_path() {
        Some(path) => println!("  Resume file: {}", path.display()),
        None => println!("  Resume: disabled"),
    }
    println!();
}
