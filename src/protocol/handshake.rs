//! BitTorrent handshake protocol
//!
//! The fixed 68-byte exchange that opens every peer connection.

use bytes::{BufMut, BytesMut};
use anyhow::Result;
use rand::Rng;
use tracing::{debug, error, trace, warn};

use crate::error::TorrentError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Encoded handshake size
pub const HANDSHAKE_LENGTH: usize = 68;

/// Client identifier placed at the start of generated peer ids
pub const PEER_ID_PREFIX: &[u8; 8] = b"-RC0001-";

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Reserved extension bits, always zero when we send
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Generate a peer ID: client prefix followed by 12 random digits
    pub fn generate_peer_id() -> [u8; 20] {
        let mut rng = rand::thread_rng();
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        for byte in peer_id[8..].iter_mut() {
            *byte = b'0' + rng.gen_range(0..10);
        }
        debug!("Generated peer ID: {}", String::from_utf8_lossy(&peer_id));
        peer_id
    }

    pub fn serialize(&self) -> [u8; HANDSHAKE_LENGTH] {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LENGTH);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);

        let mut out = [0u8; HANDSHAKE_LENGTH];
        out.copy_from_slice(&buf);
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        trace!("Deserializing handshake from {} bytes", data.len());

        if data.len() < HANDSHAKE_LENGTH {
            error!("Handshake data too short: expected {} bytes, got {}", HANDSHAKE_LENGTH, data.len());
            return Err(TorrentError::protocol_error_with_source(
                "Handshake data too short",
                format!("expected {} bytes, got {}", HANDSHAKE_LENGTH, data.len()),
            ).into());
        }

        if data[0] as usize != PROTOCOL_STRING.len() || &data[1..20] != PROTOCOL_STRING {
            warn!("Invalid protocol string in handshake");
            return Err(TorrentError::protocol_error("Invalid protocol string").into());
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Reject a handshake for a different torrent
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> Result<()> {
        if self.info_hash != *expected_info_hash {
            warn!(
                "Info hash mismatch: expected {}, got {}",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return Err(TorrentError::protocol_error_with_source(
                "Handshake info hash mismatch",
                hex::encode(self.info_hash),
            ).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_layout() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = handshake.serialize();
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);
        assert_eq!(Handshake::deserialize(&bytes).unwrap(), handshake);
    }

    #[test]
    fn test_generate_peer_id() {
        let peer_id = Handshake::generate_peer_id();
        assert_eq!(&peer_id[..8], b"-RC0001-");
        assert!(peer_id[8..].iter().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn test_validate_info_hash() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(handshake.validate(&[1u8; 20]).is_ok());
        assert!(handshake.validate(&[3u8; 20]).is_err());
    }

    #[test]
    fn test_bad_protocol_string() {
        let mut bytes = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        bytes[5] = b'X';
        assert!(Handshake::deserialize(&bytes).is_err());
        assert!(Handshake::deserialize(&bytes[..40]).is_err());
    }
}
