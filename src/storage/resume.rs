//! Resume data module
//!
//! Persists the `saved` range set so a later run can skip pieces already on
//! disk.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::TorrentError;
use crate::storage::range_set::RangeSet;
use crate::torrent::TorrentMetadata;

/// Resume data for one transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeData {
    /// Info hash as hex string
    pub info_hash: String,
    pub piece_length: u64,
    pub total_length: u64,
    /// Confirmed-on-disk ranges as `[start, end)` pairs
    pub saved: Vec<[u64; 2]>,
}

impl ResumeData {
    pub fn new(metadata: &TorrentMetadata, saved: &RangeSet) -> Self {
        Self {
            info_hash: metadata.info_hash_hex(),
            piece_length: metadata.piece_length,
            total_length: metadata.total_length(),
            saved: saved.iter().map(|r| [r.start, r.end]).collect(),
        }
    }

    /// True when this data was written for the same torrent layout
    pub fn matches(&self, metadata: &TorrentMetadata) -> bool {
        self.info_hash == metadata.info_hash_hex()
            && self.piece_length == metadata.piece_length
            && self.total_length == metadata.total_length()
    }

    pub fn saved_ranges(&self) -> RangeSet {
        RangeSet::from_ranges(self.saved.iter().map(|[start, end]| *start..*end))
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self).map_err(TorrentError::from)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data).map_err(TorrentError::from)?)
    }

    /// Write to a sibling temp file, then rename over `path`
    pub async fn save(&self, path: &Path) -> Result<()> {
        let data = self.serialize()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).await.map_err(|e| {
            TorrentError::storage_error_full("Failed to write resume data", tmp.display().to_string(), e.to_string())
        })?;
        fs::rename(&tmp, path).await.map_err(|e| {
            TorrentError::storage_error_full("Failed to replace resume data", path.display().to_string(), e.to_string())
        })?;
        debug!("Resume data saved: {} ranges", self.saved.len());
        Ok(())
    }

    pub async fn load(path: &Path) -> Result<Option<Self>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(None);
        }
        let data = fs::read(path).await.map_err(|e| {
            TorrentError::storage_error_full("Failed to read resume data", path.display().to_string(), e.to_string())
        })?;
        Ok(Some(Self::deserialize(&data)?))
    }

    /// Load resume data for `metadata`, ignoring files for other torrents
    pub async fn load_for(path: &Path, metadata: &TorrentMetadata) -> Result<Option<RangeSet>> {
        match Self::load(path).await? {
            Some(data) if data.matches(metadata) => {
                info!("Loaded resume data from {}", path.display());
                Ok(Some(data.saved_ranges()))
            }
            Some(_) => {
                warn!("Resume data at {} belongs to another torrent, ignoring it", path.display());
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::TorrentFile;

    fn metadata() -> TorrentMetadata {
        TorrentMetadata {
            announce: String::new(),
            announce_list: vec![],
            info_hash: [0xab; 20],
            piece_length: 16384,
            pieces: vec![[0u8; 20]; 2],
            name: "resume".to_string(),
            files: vec![TorrentFile { path: vec!["resume".to_string()], length: 32768 }],
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("resume.json");
        let saved = RangeSet::from_ranges(vec![0..16384]);

        ResumeData::new(&metadata(), &saved).save(&path).await.unwrap();
        let loaded = ResumeData::load_for(&path, &metadata()).await.unwrap().unwrap();
        assert_eq!(loaded, saved);
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ResumeData::load(&dir.path().join("nope.json")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_other_torrent_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resume.json");
        let mut other = metadata();
        other.info_hash = [0xcd; 20];
        ResumeData::new(&other, &RangeSet::from_ranges(vec![0..16384])).save(&path).await.unwrap();

        assert!(ResumeData::load_for(&path, &metadata()).await.unwrap().is_none());
    }

    #[test]
    fn test_corrupt_data_rejected() {
        assert!(ResumeData::deserialize(b"{not json").is_err());
    }
}
