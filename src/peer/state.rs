//! Peer state module
//!
//! Peer addressing, advertised bitfields and the lifecycle signals a peer
//! session reports to the supervisor.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

use anyhow::Result;

use crate::error::TorrentError;

/// Compact peer address: 4 bytes IPv4 followed by a big-endian port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddr(pub [u8; 6]);

impl PeerAddr {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        let mut raw = [0u8; 6];
        raw[..4].copy_from_slice(&ip.octets());
        raw[4..].copy_from_slice(&port.to_be_bytes());
        PeerAddr(raw)
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.0[0], self.0[1], self.0[2], self.0[3])
    }

    pub fn port(&self) -> u16 {
        u16::from_be_bytes([self.0[4], self.0[5]])
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip(), self.port()))
    }

    /// Split a compact peer list (6 bytes per peer)
    pub fn parse_compact_list(bytes: &[u8]) -> Result<Vec<PeerAddr>> {
        if bytes.len() % 6 != 0 {
            return Err(TorrentError::parse_error_with_source(
                "Invalid compact peer list",
                format!("length {} is not a multiple of 6", bytes.len()),
            ).into());
        }
        Ok(bytes
            .chunks_exact(6)
            .map(|chunk| {
                let mut raw = [0u8; 6];
                raw.copy_from_slice(chunk);
                PeerAddr(raw)
            })
            .collect())
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip(), self.port())
    }
}

impl From<SocketAddrV4> for PeerAddr {
    fn from(addr: SocketAddrV4) -> Self {
        PeerAddr::new(*addr.ip(), addr.port())
    }
}

impl FromStr for PeerAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let addr: SocketAddrV4 = s.parse().map_err(TorrentError::from)?;
        Ok(addr.into())
    }
}

/// Pieces a peer claims to have, most significant bit first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitfield(Vec<u8>);

impl Bitfield {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Bitfield(bytes.into())
    }

    /// A bitfield with every one of `pieces` set
    pub fn full(pieces: usize) -> Self {
        let mut bitfield = Bitfield::default();
        for i in 0..pieces {
            bitfield.set(i);
        }
        bitfield
    }

    pub fn has(&self, index: usize) -> bool {
        self.0
            .get(index / 8)
            .map(|byte| (byte >> (7 - index % 8)) & 1 == 1)
            .unwrap_or(false)
    }

    pub fn set(&mut self, index: usize) {
        let byte = index / 8;
        if byte >= self.0.len() {
            self.0.resize(byte + 1, 0);
        }
        self.0[byte] |= 1 << (7 - index % 8);
    }

    /// Union with another advertisement
    pub fn merge(&mut self, other: &Bitfield) {
        if other.0.len() > self.0.len() {
            self.0.resize(other.0.len(), 0);
        }
        for (mine, theirs) in self.0.iter_mut().zip(other.0.iter()) {
            *mine |= theirs;
        }
    }

    /// Drop bits at or beyond `pieces`, including padding in the last byte
    pub fn truncate(&mut self, pieces: usize) {
        self.0.truncate(pieces.div_ceil(8));
        if pieces % 8 != 0 {
            if let Some(last) = self.0.get_mut(pieces / 8) {
                *last &= 0xff << (8 - pieces % 8);
            }
        }
    }

    pub fn count(&self) -> usize {
        self.0.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Where a peer stands from the supervisor's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerLifecycle {
    /// Address known, session not yet started
    #[default]
    CouldBeAdded,
    /// Connected but the remote side is choking us
    Choking,
    /// Holding an assigned task
    Downloading,
    /// Unchoked and idle, waiting for a task
    Waiting,
    Dead,
}

/// Control signals from a peer session; never placed on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerSignal {
    Bitfield(Bitfield),
    Have(u32),
    Choke,
    Unchoke,
    /// Current task finished, send another
    Ready,
    Dead,
}

/// A signal tagged with the peer that raised it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub addr: PeerAddr,
    pub signal: PeerSignal,
}

impl PeerEvent {
    pub fn new(addr: PeerAddr, signal: PeerSignal) -> Self {
        Self { addr, signal }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_addr_compact() {
        let addr = PeerAddr([127, 0, 0, 1, 0x1a, 0xe1]);
        assert_eq!(addr.port(), 6881);
        assert_eq!(addr.to_string(), "127.0.0.1:6881");
        assert_eq!(addr.to_socket_addr(), "127.0.0.1:6881".parse().unwrap());
        assert_eq!("127.0.0.1:6881".parse::<PeerAddr>().unwrap(), addr);
    }

    #[test]
    fn test_parse_compact_list() {
        let bytes = [10, 0, 0, 1, 0, 80, 192, 168, 1, 2, 0x1a, 0xe1];
        let peers = PeerAddr::parse_compact_list(&bytes).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].to_string(), "10.0.0.1:80");
        assert_eq!(peers[1].to_string(), "192.168.1.2:6881");
        assert!(PeerAddr::parse_compact_list(&bytes[..7]).is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("not an address".parse::<PeerAddr>().is_err());
        assert!("[::1]:6881".parse::<PeerAddr>().is_err());
    }

    #[test]
    fn test_bitfield_msb_first() {
        let bitfield = Bitfield::from_bytes(vec![0b1100_0000, 0b0000_0001]);
        assert!(bitfield.has(0));
        assert!(bitfield.has(1));
        assert!(!bitfield.has(2));
        assert!(bitfield.has(15));
        assert!(!bitfield.has(16));
        assert_eq!(bitfield.count(), 3);
    }

    #[test]
    fn test_bitfield_set_and_merge() {
        let mut bitfield = Bitfield::default();
        bitfield.set(3);
        bitfield.set(12);
        assert_eq!(bitfield.as_bytes(), &[0b0001_0000, 0b0000_1000]);

        let mut other = Bitfield::from_bytes(vec![0b1000_0000]);
        other.merge(&bitfield);
        assert!(other.has(0) && other.has(3) && other.has(12));
        assert_eq!(Bitfield::full(10).count(), 10);
    }

    #[test]
    fn test_bitfield_truncate_clears_spare_bits() {
        let mut bitfield = Bitfield::from_bytes(vec![0xff, 0xff, 0xff]);
        bitfield.truncate(10);
        assert_eq!(bitfield.as_bytes(), &[0xff, 0b1100_0000]);
        assert!(!bitfield.has(10));

        let mut short = Bitfield::from_bytes(vec![0x80]);
        short.truncate(16);
        assert_eq!(short.as_bytes(), &[0x80]);
    }
}
