//! File store module
//!
//! Pre-allocates the transfer's files and performs positioned writes.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;
use crate::torrent::TorrentFile;

/// Handle returned by [`FileStore::alloc`], one per file in layout order
pub type FileId = usize;

/// Destination for saved ranges
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Create every file at its final size and return their handles
    async fn alloc(&self, files: &[TorrentFile]) -> Result<Vec<FileId>>;

    /// Write `data` at `offset` inside the file
    async fn write_at(&self, file: FileId, offset: u64, data: Bytes) -> Result<()>;
}

/// Reject absolute paths and parent-directory escapes
fn relative_path(file: &TorrentFile) -> Result<PathBuf> {
    let path: PathBuf = file.path.iter().collect();
    let safe = !file.path.is_empty()
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        error!("Refusing unsafe file path {:?}", file.path);
        return Err(TorrentError::validation_error_with_field(
            format!("unsafe file path {:?}", file.path),
            "path",
        ).into());
    }
    Ok(path)
}

/// Files on the local disk below a base directory
#[derive(Debug)]
pub struct DiskFileStore {
    base_path: PathBuf,
    handles: RwLock<Vec<(PathBuf, Arc<std::fs::File>)>>,
}

impl DiskFileStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            handles: RwLock::new(Vec::new()),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn handle(&self, file: FileId) -> Result<(PathBuf, Arc<std::fs::File>)> {
        let handles = self.handles.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        handles.get(file).cloned().ok_or_else(|| {
            TorrentError::storage_error(format!("unknown file handle {}", file)).into()
        })
    }
}

#[cfg(unix)]
fn positioned_write(file: &std::fs::File, offset: u64, data: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn positioned_write(file: &std::fs::File, mut offset: u64, mut data: &[u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let n = file.seek_write(data, offset)?;
        if n == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        data = &data[n..];
        offset += n as u64;
    }
    Ok(())
}

#[async_trait]
impl FileStore for DiskFileStore {
    async fn alloc(&self, files: &[TorrentFile]) -> Result<Vec<FileId>> {
        info!("Allocating {} files under {}", files.len(), self.base_path.display());

        let mut opened = Vec::with_capacity(files.len());
        for file in files {
            let file_path = self.base_path.join(relative_path(file)?);
            if let Some(parent) = file_path.parent() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    error!("Failed to create directory '{}': {}", parent.display(), e);
                    TorrentError::storage_error_full("Failed to create directory", parent.display().to_string(), e.to_string())
                })?;
            }

            // No truncation: resume state refers to bytes already in the file.
            let handle = fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&file_path)
                .await
                .map_err(|e| {
                    error!("Failed to create file '{}': {}", file_path.display(), e);
                    TorrentError::storage_error_full("Failed to create file", file_path.display().to_string(), e.to_string())
                })?;
            handle.set_len(file.length).await.map_err(|e| {
                error!("Failed to set file length for '{}': {}", file_path.display(), e);
                TorrentError::storage_error_full("Failed to set file length", file_path.display().to_string(), e.to_string())
            })?;
            debug!("Allocated {} ({} bytes)", file_path.display(), file.length);

            opened.push((file_path, Arc::new(handle.into_std().await)));
        }

        let mut handles = self.handles.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let first = handles.len();
        handles.extend(opened);
        Ok((first..handles.len()).collect())
    }

    async fn write_at(&self, file: FileId, offset: u64, data: Bytes) -> Result<()> {
        let (path, handle) = self.handle(file)?;
        trace!("Writing {} bytes to {} at {}", data.len(), path.display(), offset);

        tokio::task::spawn_blocking(move || positioned_write(&handle, offset, &data))
            .await
            .map_err(|e| TorrentError::storage_error_full("Write task failed", path.display().to_string(), e.to_string()))?
            .map_err(|e| {
                error!("Failed to write to file '{}': {}", path.display(), e);
                TorrentError::storage_error_full("Failed to write to file", path.display().to_string(), e.to_string())
            })?;
        Ok(())
    }
}

/// In-memory store, used for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: Mutex<Vec<Vec<u8>>>,
    /// Pending injected failures per file
    failures: Mutex<HashMap<FileId, u32>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes to `file` fail
    pub fn fail_next_writes(&self, file: FileId, count: u32) {
        self.failures.lock().unwrap_or_else(|p| p.into_inner()).insert(file, count);
    }

    /// Snapshot of a file's content
    pub fn contents(&self, file: FileId) -> Option<Vec<u8>> {
        self.files.lock().unwrap_or_else(|p| p.into_inner()).get(file).cloned()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn alloc(&self, files: &[TorrentFile]) -> Result<Vec<FileId>> {
        let mut stored = self.files.lock().unwrap_or_else(|p| p.into_inner());
        let first = stored.len();
        for file in files {
            relative_path(file)?;
            stored.push(vec![0u8; file.length as usize]);
        }
        Ok((first..stored.len()).collect())
    }

    async fn write_at(&self, file: FileId, offset: u64, data: Bytes) -> Result<()> {
        {
            let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(left) = failures.get_mut(&file) {
                if *left > 0 {
                    *left -= 1;
                    return Err(TorrentError::storage_error_with_path("Injected write failure", file.to_string()).into());
                }
            }
        }

        let mut stored = self.files.lock().unwrap_or_else(|p| p.into_inner());
        let target = stored
            .get_mut(file)
            .ok_or_else(|| TorrentError::storage_error(format!("unknown file handle {}", file)))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > target.len() {
            return Err(TorrentError::storage_error_with_path(
                format!("write [{}, {}) past end of file ({} bytes)", start, end, target.len()),
                file.to_string(),
            ).into());
        }
        target[start..end].copy_from_slice(&data);
        Ok(())
    }
}
