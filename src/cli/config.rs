//! CLI configuration module
//!
//! Turns parsed arguments plus torrent metadata into validated engine settings.

use crate::cli::args::CliArgs;
use crate::error::TorrentError;
use crate::peer::PeerAddr;
use crate::torrent::TorrentMetadata;
use crate::tracker::HttpTrackerClient;
use crate::transfer::TransferConfig;
use std::path::PathBuf;
use anyhow::Result;

/// Configuration for one client run
#[derive(Debug, Clone)]
pub struct Config {
    pub metadata: TorrentMetadata,
    /// Download directory
    pub output_dir: PathBuf,
    /// Port reported to the tracker
    pub port: u16,
    pub max_peers: usize,
    pub file_workers: usize,
    pub task_budget: u64,
    pub peers: Vec<PeerAddr>,
    pub use_tracker: bool,
    pub resume: bool,
    pub verbose: bool,
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs, metadata: TorrentMetadata) -> Self {
        let output_dir = args.output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("./downloads"));

        Self {
            metadata,
            output_dir,
            port: args.port,
            max_peers: args.max_peers,
            file_workers: args.file_workers,
            task_budget: args.task_budget,
            peers: args.peers.clone(),
            use_tracker: !args.no_tracker,
            resume: args.resume,
            verbose: args.verbose,
            quiet: args.quiet,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(TorrentError::config_error_with_field("Port cannot be 0", "port").into());
        }

        if self.max_peers == 0 {
            return Err(TorrentError::config_error_with_field("must be at least 1", "max_peers").into());
        }

        if self.file_workers == 0 {
            return Err(TorrentError::config_error_with_field("must be at least 1", "file_workers").into());
        }

        if self.task_budget == 0 {
            return Err(TorrentError::config_error_with_field("must be at least 1", "task_budget").into());
        }

        if self.output_dir.as_os_str().is_empty() {
            return Err(TorrentError::config_error_with_field("cannot be empty", "output_dir").into());
        }

        if !self.has_peer_source() {
            return Err(TorrentError::config_error(
                "No peer source: the torrent has no tracker and no --peer was given",
            ).into());
        }

        Ok(())
    }

    /// True when the tracker or a static peer can supply addresses
    pub fn has_peer_source(&self) -> bool {
        self.is_tracker_enabled() || !self.peers.is_empty()
    }

    pub fn is_tracker_enabled(&self) -> bool {
        let candidates = std::iter::once(&self.metadata.announce).chain(&self.metadata.announce_list);
        self.use_tracker && HttpTrackerClient::pick_url(candidates).is_some()
    }

    /// Resume file kept in the output directory, keyed by info hash
    pub fn resume_path(&self) -> Option<PathBuf> {
        if !self.resume {
            return None;
        }
        Some(self.output_dir.join(format!(".{}.resume.json", self.metadata.info_hash_hex())))
    }

    /// Engine settings for this run
    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            max_peers: self.max_peers,
            file_workers: self.file_workers,
            task_budget: self.task_budget,
            listen_port: self.port,
            resume_path: self.resume_path(),
            use_tracker: self.use_tracker,
            static_peers: self.peers.clone(),
            ..TransferConfig::default()
        }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentFile;
    use clap::Parser;

    fn metadata(announce: &str) -> TorrentMetadata {
        TorrentMetadata {
            announce: announce.to_string(),
            announce_list: vec![],
            info_hash: [0xab; 20],
            piece_length: 262144,
            pieces: vec![[0u8; 20]; 4],
            name: "test_torrent".to_string(),
            files: vec![TorrentFile { path: vec!["test_torrent".to_string()], length: 1048576 }],
        }
    }

    fn config(argv: &[&str], announce: &str) -> Config {
        let mut full = vec!["rust-torrent-client", "test.torrent"];
        full.extend_from_slice(argv);
        let args = CliArgs::try_parse_from(full).unwrap();
        Config::from_args(&args, metadata(announce))
    }

    #[test]
    fn test_config_from_args() {
        let config = config(
            &["-o", "/tmp/downloads", "-p", "6882", "-m", "8", "--file-workers", "3", "--resume"],
            "http://tracker.example.com/announce",
        );

        assert_eq!(config.output_dir, PathBuf::from("/tmp/downloads"));
        assert_eq!(config.port, 6882);
        assert_eq!(config.max_peers, 8);
        assert!(config.is_tracker_enabled());
        assert!(config.validate().is_ok());

        let transfer = config.transfer_config();
        assert_eq!(transfer.max_peers, 8);
        assert_eq!(transfer.file_workers, 3);
        assert_eq!(transfer.listen_port, 6882);
        assert_eq!(
            transfer.resume_path,
            Some(PathBuf::from(format!("/tmp/downloads/.{}.resume.json", "ab".repeat(20))))
        );
    }

    #[test]
    fn test_config_validate_invalid_values() {
        let announce = "http://tracker.example.com/announce";
        assert!(config(&["-p", "0"], announce).validate().is_err());
        assert!(config(&["-m", "0"], announce).validate().is_err());
        assert!(config(&["--file-workers", "0"], announce).validate().is_err());
        assert!(config(&["--task-budget", "0"], announce).validate().is_err());
    }

    #[test]
    fn test_config_requires_peer_source() {
        assert!(config(&[], "").validate().is_err());
        assert!(config(&[], "udp://tracker.example:1337/announce").validate().is_err());
        assert!(config(&["--no-tracker"], "http://t/announce").validate().is_err());

        let static_only = config(&["--no-tracker", "--peer", "127.0.0.1:6881"], "http://t/announce");
        assert!(static_only.validate().is_ok());
        assert!(!static_only.transfer_config().use_tracker);
        assert_eq!(static_only.transfer_config().static_peers.len(), 1);
        assert_eq!(static_only.transfer_config().resume_path, None);
    }
}
