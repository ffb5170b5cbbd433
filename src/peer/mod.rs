//! Peer module
//!
//! Peer addressing, lifecycle signals and the per-connection session task.

pub mod session;
pub mod state;

pub use session::{DownloadRange, PeerSession, SessionConfig};
pub use state::{Bitfield, PeerAddr, PeerEvent, PeerLifecycle, PeerSignal};
