//! Transfer module
//!
//! Wires the piece manager, supervisor and tracker together for one torrent
//! and owns cancellation and completion.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::TorrentError;
use crate::peer::{PeerAddr, SessionConfig};
use crate::protocol::Handshake;
use crate::storage::{FileStore, PieceArray, PieceManager, ResumeData, SaveConfig};
use crate::supervisor::{Supervisor, SupervisorConfig};
use crate::torrent::TorrentMetadata;
use crate::tracker::{Announcer, HttpTrackerClient, StatDiff, StatsPublisher, TransferStats};

/// Block events buffered between sessions and the piece manager
const BLOCK_QUEUE: usize = 256;

/// Engine settings for one transfer
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Concurrent peer connections
    pub max_peers: usize,
    pub file_workers: usize,
    /// Bytes handed to a peer per task
    pub task_budget: u64,
    pub block_size: u32,
    pub max_outstanding_requests: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub keepalive_interval: Duration,
    pub save_retry_limit: u32,
    pub save_retry_base_delay: Duration,
    pub save_retry_max_delay: Duration,
    /// Port reported to the tracker
    pub listen_port: u16,
    pub resume_path: Option<PathBuf>,
    pub use_tracker: bool,
    /// Peers dialed in addition to tracker results
    pub static_peers: Vec<PeerAddr>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_peers: 5,
            file_workers: 2,
            task_budget: 256 * 1024,
            block_size: 16 * 1024,
            max_outstanding_requests: 5,
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(50),
            read_timeout: Duration::from_secs(180),
            write_timeout: Duration::from_secs(180),
            keepalive_interval: Duration::from_secs(5),
            save_retry_limit: 5,
            save_retry_base_delay: Duration::from_millis(500),
            save_retry_max_delay: Duration::from_secs(30),
            listen_port: 6881,
            resume_path: None,
            use_tracker: true,
            static_peers: Vec::new(),
        }
    }
}

impl TransferConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            keepalive_interval: self.keepalive_interval,
            block_size: self.block_size,
            max_outstanding: self.max_outstanding_requests,
        }
    }

    pub fn save_config(&self) -> SaveConfig {
        SaveConfig {
            workers: self.file_workers,
            retry_limit: self.save_retry_limit,
            retry_base_delay: self.save_retry_base_delay,
            retry_max_delay: self.save_retry_max_delay,
            resume_path: self.resume_path.clone(),
            ..SaveConfig::default()
        }
    }
}

/// One torrent download from start to completion or shutdown
pub struct Transfer {
    metadata: Arc<TorrentMetadata>,
    store: Arc<dyn FileStore>,
    config: TransferConfig,
    peer_id: [u8; 20],
    pieces: Arc<PieceArray>,
    stats: StatsPublisher,
}

impl Transfer {
    pub fn new(metadata: TorrentMetadata, store: Arc<dyn FileStore>, config: TransferConfig) -> Result<Self> {
        metadata.validate()?;
        let pieces = Arc::new(PieceArray::new(&metadata));
        let stats = StatsPublisher::new(metadata.total_length());
        Ok(Self {
            metadata: Arc::new(metadata),
            store,
            config,
            peer_id: Handshake::generate_peer_id(),
            pieces,
            stats,
        })
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    pub fn pieces(&self) -> Arc<PieceArray> {
        self.pieces.clone()
    }

    /// Live statistics, updated on every block and save
    pub fn subscribe(&self) -> watch::Receiver<TransferStats> {
        self.stats.subscribe()
    }

    async fn restore(&self) {
        let Some(path) = self.config.resume_path.as_deref() else {
            return;
        };
        match ResumeData::load_for(path, &self.metadata).await {
            Ok(Some(saved)) => {
                let restored = self.pieces.restore_saved(&saved);
                self.stats.apply(StatDiff::restored(restored));
                info!("Resuming with {} bytes already saved", restored);
            }
            Ok(None) => debug!("No resume data at {}", path.display()),
            Err(e) => warn!("Ignoring unreadable resume data: {}", e),
        }
    }

    /// Download until every byte is saved, `shutdown` flips or a fatal error occurs
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<TransferStats> {
        info!(
            "Starting transfer of '{}' ({} bytes, {} pieces)",
            self.metadata.name,
            self.metadata.total_length(),
            self.metadata.piece_count()
        );

        let tracker = if self.config.use_tracker {
            let candidates = std::iter::once(&self.metadata.announce).chain(&self.metadata.announce_list);
            match HttpTrackerClient::pick_url(candidates) {
                Some(url) => Some(HttpTrackerClient::new(url)?),
                None => {
                    warn!("No usable HTTP tracker for '{}'", self.metadata.name);
                    None
                }
            }
        } else {
            None
        };
        let file_ids = self.store.alloc(&self.metadata.files).await?;
        self.restore().await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (block_tx, block_rx) = mpsc::channel(BLOCK_QUEUE);
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();

        let manager = PieceManager::new(
            self.metadata.clone(),
            self.pieces.clone(),
            self.store.clone(),
            file_ids,
            self.stats.clone(),
            self.config.save_config(),
        );
        let mut manager = tokio::spawn(manager.run(block_rx, stop_rx.clone()));

        let supervisor = Supervisor::new(
            SupervisorConfig {
                info_hash: self.metadata.info_hash,
                peer_id: self.peer_id,
                max_peers: self.config.max_peers,
                task_budget: self.config.task_budget,
                rescan_interval: self.config.keepalive_interval,
                session: self.config.session_config(),
            },
            self.pieces.clone(),
            block_tx,
        );
        let supervisor = tokio::spawn(supervisor.run(peers_rx, stop_rx.clone()));

        for peer in &self.config.static_peers {
            let _ = peers_tx.send(*peer);
        }

        let announcer = if let Some(client) = tracker {
            let announcer = Announcer::new(
                Arc::new(client),
                self.metadata.info_hash,
                self.peer_id,
                self.config.listen_port,
                self.stats.subscribe(),
                peers_tx,
            );
            Some(tokio::spawn(announcer.run(stop_rx.clone())))
        } else {
            drop(peers_tx);
            None
        };

        let mut manager_done = false;
        let outcome: Result<()> = tokio::select! {
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                info!("Transfer interrupted");
                Ok(())
            }
            joined = &mut manager => {
                manager_done = true;
                match joined {
                    Ok(result) => result,
                    Err(e) => Err(TorrentError::storage_error(format!("Piece manager task failed: {}", e)).into()),
                }
            }
        };

        let _ = stop_tx.send(true);
        if !manager_done {
            match (&mut manager).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Piece manager stopped with error: {}", e),
                Err(e) => error!("Piece manager task failed: {}", e),
            }
        }
        if let Err(e) = supervisor.await {
            error!("Supervisor task failed: {}", e);
        }
        if let Some(announcer) = announcer {
            if let Err(e) = announcer.await {
                error!("Announcer task failed: {}", e);
            }
        }

        outcome?;
        let stats = self.stats.snapshot();
        if stats.is_complete() {
            info!("Transfer of '{}' complete", self.metadata.name);
        }
        Ok(stats)
    }
}

/// Raise `shutdown` once `signal` fires
///
/// If the signal cannot be installed the sender is held until the task is
/// aborted.
pub async fn stop_on_signal<F>(signal: F, shutdown: watch::Sender<bool>)
where
    F: std::future::Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Interrupt received, shutting down");
            let _ = shutdown.send(true);
        }
        Err(e) => {
            warn!("Failed to listen for interrupt: {}", e);
            std::future::pending::<()>().await;
            drop(shutdown);
        }
    }
}
