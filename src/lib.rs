//! rust-torrent-client
//!
//! A BitTorrent download engine: tracker discovery, bounded peer sessions,
//! piece claiming, hash validation and asynchronous saving with resume.

pub mod error;
pub mod torrent;
pub mod protocol;
pub mod peer;
pub mod storage;
pub mod supervisor;
pub mod tracker;
pub mod transfer;
pub mod cli;

pub use error::TorrentError;

pub use torrent::{TorrentFile, TorrentMetadata, TorrentParser};
pub use protocol::{Handshake, Message, MessageId};
pub use peer::{Bitfield, DownloadRange, PeerAddr, PeerEvent, PeerLifecycle, PeerSession, PeerSignal};
pub use storage::{
    BlockOutcome, DiskFileStore, FileStore, MemoryFileStore, PieceArray, PieceManager, PieceState,
    RangeSet, ResumeData,
};
pub use supervisor::{Scheduler, Supervisor, SupervisorConfig};
pub use tracker::{Announcer, HttpTrackerClient, TrackerClient, TransferStats};
pub use transfer::{Transfer, TransferConfig};
pub use cli::{CliArgs, Config, ProgressDisplay};
