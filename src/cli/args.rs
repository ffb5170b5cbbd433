//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

use crate::peer::PeerAddr;

/// CLI arguments for the torrent client
#[derive(Debug, Parser)]
#[command(name = "rust-torrent-client")]
#[command(about = "Download a torrent from its swarm", long_about = None)]
pub struct CliArgs {
    /// Path to the .torrent file
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// Download directory
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Port reported to the tracker
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// Maximum number of concurrent peer connections
    #[arg(short, long, default_value_t = 5)]
    pub max_peers: usize,

    /// Number of file writer workers
    #[arg(long, default_value_t = 2)]
    pub file_workers: usize,

    /// Bytes handed to a peer per download task
    #[arg(long, default_value_t = 256 * 1024)]
    pub task_budget: u64,

    /// Additional peer to dial (repeatable), as IP:PORT
    #[arg(long = "peer", value_name = "ADDR")]
    pub peers: Vec<PeerAddr>,

    /// Skip tracker announces and use only --peer addresses
    #[arg(long)]
    pub no_tracker: bool,

    /// Persist progress next to the download and resume from it
    #[arg(long)]
    pub resume: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long)]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let args = CliArgs::try_parse_from(["rust-torrent-client", "test.torrent"]).unwrap();

        assert_eq!(args.torrent_file, PathBuf::from("test.torrent"));
        assert_eq!(args.port, 6881);
        assert_eq!(args.max_peers, 5);
        assert_eq!(args.file_workers, 2);
        assert_eq!(args.task_budget, 256 * 1024);
        assert!(args.peers.is_empty());
        assert!(!args.no_tracker);
        assert_eq!(args.log_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_static_peers() {
        let args = CliArgs::try_parse_from([
            "rust-torrent-client",
            "test.torrent",
            "--peer",
            "127.0.0.1:6881",
            "--peer",
            "10.0.0.2:51413",
            "--no-tracker",
            "-v",
        ])
        .unwrap();

        assert_eq!(args.peers.len(), 2);
        assert_eq!(args.peers[1].to_string(), "10.0.0.2:51413");
        assert!(args.no_tracker);
        assert_eq!(args.log_level(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_bad_peer_rejected() {
        assert!(CliArgs::try_parse_from(["rust-torrent-client", "t.torrent", "--peer", "nope"]).is_err());
    }
}
