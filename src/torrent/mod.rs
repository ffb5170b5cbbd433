//! Torrent metadata module
//!
//! Decoding of .torrent files into the immutable description of a transfer.

pub mod parser;
pub mod info;

pub use parser::TorrentParser;
pub use info::{TorrentFile, TorrentMetadata};
