//! Torrent metadata structures
//!
//! The immutable description of a transfer: piece hashes, piece length and
//! the ordered file layout.

use std::ops::Range;

use anyhow::Result;
use sha1::{Digest, Sha1};

use crate::error::TorrentError;

/// A file in the transfer, in layout order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path components relative to the output directory
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

/// Decoded torrent metadata
#[derive(Debug, Clone)]
pub struct TorrentMetadata {
    /// Primary tracker announce URL
    pub announce: String,
    /// All tracker announce URLs, primary first
    pub announce_list: Vec<String>,
    /// SHA1 hash of the bencoded info dictionary
    pub info_hash: [u8; 20],
    /// Size of each piece in bytes (the last piece may be shorter)
    pub piece_length: u64,
    /// Expected SHA1 hash of every piece
    pub pieces: Vec<[u8; 20]>,
    /// Torrent name
    pub name: String,
    /// Files in layout order; single-file torrents hold one entry
    pub files: Vec<TorrentFile>,
}

impl TorrentMetadata {
    /// Sum of all file lengths
    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_multi_file(&self) -> bool {
        self.files.len() > 1
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Absolute byte range of every file
    pub fn file_ranges(&self) -> Vec<Range<u64>> {
        let mut offset = 0;
        self.files
            .iter()
            .map(|f| {
                let range = offset..offset + f.length;
                offset += f.length;
                range
            })
            .collect()
    }

    /// Check that the piece table matches the file layout
    pub fn validate(&self) -> Result<()> {
        if self.piece_length == 0 {
            return Err(TorrentError::validation_error_with_field("piece length must be positive", "piece length").into());
        }
        let total = self.total_length();
        let expected = total.div_ceil(self.piece_length);
        if expected != self.pieces.len() as u64 {
            return Err(TorrentError::validation_error_with_field(
                format!("{} bytes need {} pieces, metadata lists {}", total, expected, self.pieces.len()),
                "pieces",
            ).into());
        }
        Ok(())
    }

    /// SHA1 of the raw info dictionary bytes
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Split the concatenated `pieces` field into 20-byte hashes
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::parse_error_with_source(
                "Invalid pieces field",
                format!("length must be a multiple of 20, got {}", pieces_bytes.len()),
            ).into());
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(files: Vec<u64>, piece_length: u64, pieces: usize) -> TorrentMetadata {
        TorrentMetadata {
            announce: "http://tracker.example.com/announce".to_string(),
            announce_list: vec!["http://tracker.example.com/announce".to_string()],
            info_hash: [1u8; 20],
            piece_length,
            pieces: vec![[0u8; 20]; pieces],
            name: "test".to_string(),
            files: files
                .into_iter()
                .enumerate()
                .map(|(i, length)| TorrentFile { path: vec![format!("file{}", i)], length })
                .collect(),
        }
    }

    #[test]
    fn test_total_length_and_file_ranges() {
        let meta = metadata(vec![500, 524, 100], 512, 3);
        assert_eq!(meta.total_length(), 1124);
        assert_eq!(meta.file_ranges(), vec![0..500, 500..1024, 1024..1124]);
        assert!(meta.is_multi_file());
        assert_eq!(meta.info_hash_hex(), hex::encode([1u8; 20]));
    }

    #[test]
    fn test_validate_piece_count() {
        assert!(metadata(vec![32768], 16384, 2).validate().is_ok());
        assert!(metadata(vec![32769], 16384, 3).validate().is_ok());
        assert!(metadata(vec![32769], 16384, 2).validate().is_err());
        assert!(metadata(vec![10], 0, 1).validate().is_err());
    }

    #[test]
    fn test_parse_piece_hashes() {
        let hashes: Vec<u8> = (0..40).map(|i| i as u8).collect();
        let result = TorrentMetadata::parse_piece_hashes(&hashes).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[1][0], 20);
        assert!(TorrentMetadata::parse_piece_hashes(&[1u8; 21]).is_err());
    }

    #[test]
    fn test_generate_info_hash() {
        let hash = TorrentMetadata::generate_info_hash(b"abc");
        assert_eq!(hex::encode(hash), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
