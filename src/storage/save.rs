//! File-save handoff
//!
//! The piece manager turns block arrivals into validated ranges and feeds
//! them to a fixed pool of file workers. A worker announces readiness on a
//! bounded channel (one slot per worker), takes one write task, performs the
//! positioned write and reports the outcome on the task's callback channel.

use std::collections::HashMap;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::storage::file::{FileId, FileStore};
use crate::storage::piece::{BlockOutcome, PieceArray};
use crate::storage::resume::ResumeData;
use crate::torrent::TorrentMetadata;
use crate::tracker::stats::{StatDiff, StatsPublisher};

/// A block written into its piece buffer by a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEvent {
    /// Absolute byte offset
    pub offset: u64,
    pub length: u64,
}

/// One positioned write for a file worker
#[derive(Debug)]
pub struct WriteTask {
    pub file: FileId,
    /// Offset inside the file
    pub offset: u64,
    /// Absolute range being saved
    pub range: Range<u64>,
    pub data: Bytes,
    pub reply: mpsc::UnboundedSender<SaveOutcome>,
}

/// Result of a write, reported back to the piece manager
#[derive(Debug)]
pub struct SaveOutcome {
    pub range: Range<u64>,
    pub result: std::result::Result<(), String>,
}

/// Save pipeline settings
#[derive(Debug, Clone)]
pub struct SaveConfig {
    pub workers: usize,
    /// Consecutive failures of one range before the transfer aborts
    pub retry_limit: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub resume_path: Option<PathBuf>,
    /// Minimum spacing between resume data writes
    pub resume_interval: Duration,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            retry_limit: 5,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            resume_path: None,
            resume_interval: Duration::from_secs(5),
        }
    }
}

impl SaveConfig {
    /// Delay before retry number `attempt` (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_base_delay
            .checked_mul(factor)
            .unwrap_or(self.retry_max_delay)
            .min(self.retry_max_delay)
    }
}

/// A pool member performing positioned writes
pub struct FileWorker {
    id: usize,
    store: Arc<dyn FileStore>,
    tasks: Arc<Mutex<mpsc::Receiver<WriteTask>>>,
    ready: mpsc::Sender<()>,
}

impl FileWorker {
    pub fn new(
        id: usize,
        store: Arc<dyn FileStore>,
        tasks: Arc<Mutex<mpsc::Receiver<WriteTask>>>,
        ready: mpsc::Sender<()>,
    ) -> Self {
        Self { id, store, tasks, ready }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!("File worker {} started", self.id);
        loop {
            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                sent = self.ready.send(()) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }

            let task = tokio::select! {
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                task = async { self.tasks.lock().await.recv().await } => task,
            };
            let Some(task) = task else { break };

            trace!("Worker {} writing [{}, {})", self.id, task.range.start, task.range.end);
            let result = self
                .store
                .write_at(task.file, task.offset, task.data)
                .await
                .map_err(|e| e.to_string());
            if let Err(ref e) = result {
                warn!("Worker {} failed to save [{}, {}): {}", self.id, task.range.start, task.range.end, e);
            }
            if task.reply.send(SaveOutcome { range: task.range, result }).is_err() {
                break;
            }
        }
        debug!("File worker {} stopped", self.id);
    }
}

/// Single task owning block validation and the save queue
pub struct PieceManager {
    metadata: Arc<TorrentMetadata>,
    pieces: Arc<PieceArray>,
    store: Arc<dyn FileStore>,
    file_ids: Vec<FileId>,
    stats: StatsPublisher,
    config: SaveConfig,
    /// Failure count per range start
    failures: HashMap<u64, u32>,
    idle_workers: usize,
    last_persist: Instant,
}

impl PieceManager {
    pub fn new(
        metadata: Arc<TorrentMetadata>,
        pieces: Arc<PieceArray>,
        store: Arc<dyn FileStore>,
        file_ids: Vec<FileId>,
        stats: StatsPublisher,
        config: SaveConfig,
    ) -> Self {
        Self {
            metadata,
            pieces,
            store,
            file_ids,
            stats,
            config,
            failures: HashMap::new(),
            idle_workers: 0,
            last_persist: Instant::now(),
        }
    }

    /// Process blocks and saves until everything is on disk or shutdown.
    ///
    /// Errors only on broken invariants or a range that keeps failing to save.
    pub async fn run(mut self, mut blocks: mpsc::Receiver<BlockEvent>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let workers = self.config.workers.max(1);
        let (ready_tx, mut ready_rx) = mpsc::channel(workers);
        let (task_tx, task_rx) = mpsc::channel(workers);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<Range<u64>>();

        let mut pool = JoinSet::new();
        for id in 0..workers {
            let worker = FileWorker::new(id, self.store.clone(), task_rx.clone(), ready_tx.clone());
            pool.spawn(worker.run(shutdown.clone()));
        }
        drop(ready_tx);
        info!("Piece manager started with {} file workers", workers);

        let result = loop {
            if self.pieces.is_complete() {
                info!("All {} bytes saved", self.pieces.total_length());
                break Ok(());
            }

            let step = tokio::select! {
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                    debug!("Piece manager shutting down");
                    break Ok(());
                }
                Some(outcome) = outcome_rx.recv() => self.on_save_outcome(outcome, &retry_tx).await,
                Some(()) = ready_rx.recv() => {
                    self.idle_workers += 1;
                    Ok(())
                }
                Some(range) = retry_rx.recv() => {
                    self.pieces.save_failed(range);
                    Ok(())
                }
                Some(block) = blocks.recv() => {
                    self.on_block(block);
                    Ok(())
                }
            };

            if let Err(e) = step {
                break Err(e);
            }
            if let Err(e) = self.pump(&task_tx, &outcome_tx).await {
                break Err(e);
            }
        };

        if let Err(ref e) = result {
            error!("Piece manager stopped: {}", e);
        }
        drop(task_tx);
        pool.shutdown().await;
        self.persist().await;
        result
    }

    fn on_block(&mut self, block: BlockEvent) {
        let outcome = self.pieces.on_block_downloaded(block.offset, block.length);
        match outcome {
            BlockOutcome::Validated { index, .. } => debug!("Piece {} ready to save", index),
            BlockOutcome::Corrupted { index, .. } => warn!("Piece {} corrupted, will be fetched again", index),
            _ => {}
        }
        self.stats.apply(StatDiff::from_block(&outcome));
    }

    async fn on_save_outcome(&mut self, outcome: SaveOutcome, retry_tx: &mpsc::UnboundedSender<Range<u64>>) -> Result<()> {
        let range = outcome.range;
        let len = range.end - range.start;

        match outcome.result {
            Ok(()) => {
                self.stats.apply(StatDiff::save_succeeded(len));
                self.failures.retain(|start, _| !range.contains(start));
                let finished = self.pieces.save_completed(range);
                if !finished.is_empty() && self.last_persist.elapsed() >= self.config.resume_interval {
                    self.persist().await;
                }
                Ok(())
            }
            Err(reason) => {
                self.stats.apply(StatDiff::save_failed(len));
                let attempts = self.failures.entry(range.start).or_insert(0);
                *attempts += 1;
                if *attempts >= self.config.retry_limit {
                    error!("Giving up on [{}, {}) after {} failed writes", range.start, range.end, attempts);
                    return Err(TorrentError::storage_error_full(
                        format!("Failed to save [{}, {}) after {} attempts", range.start, range.end, attempts),
                        self.metadata.name.clone(),
                        reason,
                    ).into());
                }

                let delay = self.config.retry_delay(*attempts);
                debug!("Retrying [{}, {}) in {:?}", range.start, range.end, delay);
                let retry_tx = retry_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = retry_tx.send(range);
                });
                Ok(())
            }
        }
    }

    /// Hand queued ranges to idle workers
    async fn pump(&mut self, task_tx: &mpsc::Sender<WriteTask>, outcome_tx: &mpsc::UnboundedSender<SaveOutcome>) -> Result<()> {
        while self.idle_workers > 0 {
            let Some(save) = self.pieces.next_save()? else {
                break;
            };
            let file = *self.file_ids.get(save.file_index).ok_or_else(|| {
                TorrentError::validation_error_with_field(format!("no handle for file {}", save.file_index), "file_ids")
            })?;
            let len = save.range.end - save.range.start;

            self.stats.apply(StatDiff::save_dispatched(len));
            self.idle_workers -= 1;
            task_tx
                .send(WriteTask {
                    file,
                    offset: save.file_offset,
                    range: save.range,
                    data: save.data,
                    reply: outcome_tx.clone(),
                })
                .await
                .map_err(|_| TorrentError::storage_error("File workers are gone"))?;
        }
        Ok(())
    }

    async fn persist(&mut self) {
        let Some(path) = self.config.resume_path.clone() else {
            return;
        };
        self.last_persist = Instant::now();
        let data = ResumeData::new(&self.metadata, &self.pieces.saved());
        if let Err(e) = data.save(&path).await {
            warn!("Failed to write resume data to {}: {}", path.display(), e);
        }
    }
}
