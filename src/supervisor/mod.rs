//! Supervisor module
//!
//! Single event loop owning peer lifecycles and piece claims. Sessions talk
//! to it only through channels; nothing else touches the scheduler.

pub mod scheduler;

pub use scheduler::{Command, Scheduler};
pub use crate::peer::DownloadRange;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::peer::{PeerAddr, PeerEvent, PeerSession, PeerSignal, SessionConfig};
use crate::storage::{BlockEvent, PieceArray};

/// Settings shared by the supervisor and the sessions it spawns
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub max_peers: usize,
    /// Bytes assigned to a peer per task
    pub task_budget: u64,
    /// Period of the idle-peer rescan
    pub rescan_interval: Duration,
    pub session: SessionConfig,
}

/// Owns the scheduler and every peer session
pub struct Supervisor {
    config: SupervisorConfig,
    scheduler: Scheduler,
    pieces: Arc<PieceArray>,
    blocks: mpsc::Sender<BlockEvent>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    task_senders: HashMap<PeerAddr, mpsc::Sender<DownloadRange>>,
    sessions: JoinSet<()>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, pieces: Arc<PieceArray>, blocks: mpsc::Sender<BlockEvent>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(pieces.clone(), config.max_peers, config.task_budget);
        Self {
            config,
            scheduler,
            pieces,
            blocks,
            events_tx,
            events_rx,
            task_senders: HashMap::new(),
            sessions: JoinSet::new(),
        }
    }

    /// Consume discovered addresses and peer events until shutdown
    pub async fn run(mut self, mut peers: mpsc::UnboundedReceiver<PeerAddr>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Supervisor started (max {} peers)", self.config.max_peers);
        let mut rescan = tokio::time::interval(self.config.rescan_interval);
        let mut discovery_open = true;
        let session_shutdown = shutdown.clone();

        loop {
            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                Some(event) = self.events_rx.recv() => {
                    if event.signal == PeerSignal::Dead {
                        self.task_senders.remove(&event.addr);
                    }
                    let commands = self.scheduler.on_event(event);
                    self.execute(commands, &session_shutdown);
                }
                addr = peers.recv(), if discovery_open => match addr {
                    Some(addr) => {
                        let commands = self.scheduler.add_peer(addr);
                        self.execute(commands, &session_shutdown);
                    }
                    None => {
                        debug!("Peer discovery finished");
                        discovery_open = false;
                    }
                },
                _ = rescan.tick() => {
                    let commands = self.scheduler.assign_waiting();
                    self.execute(commands, &session_shutdown);
                }
                Some(joined) = self.sessions.join_next() => {
                    if let Err(e) = joined {
                        warn!("Peer session task failed: {}", e);
                    }
                }
            }
        }

        info!("Supervisor stopping, {} sessions live", self.scheduler.live_peers());
        self.task_senders.clear();
        self.sessions.shutdown().await;
        Ok(())
    }

    fn execute(&mut self, commands: Vec<Command>, shutdown: &watch::Receiver<bool>) {
        for command in commands {
            match command {
                Command::Spawn(addr) => self.spawn(addr, shutdown.clone()),
                Command::Dispatch { addr, task } => self.dispatch(addr, task),
            }
        }
    }

    fn spawn(&mut self, addr: PeerAddr, shutdown: watch::Receiver<bool>) {
        let (task_tx, task_rx) = mpsc::channel(1);
        self.task_senders.insert(addr, task_tx);
        let session = PeerSession::new(
            addr,
            self.config.info_hash,
            self.config.peer_id,
            self.pieces.clone(),
            self.config.session.clone(),
            self.events_tx.clone(),
            self.blocks.clone(),
            task_rx,
        );
        debug!("Starting session for {}", addr);
        self.sessions.spawn(session.run(shutdown));
    }

    fn dispatch(&mut self, addr: PeerAddr, task: DownloadRange) {
        let Some(sender) = self.task_senders.get(&addr) else {
            self.scheduler.dispatch_failed(&addr);
            return;
        };
        match sender.try_send(task) {
            Ok(()) => trace!("Dispatched [{}, {}) to {}", task.offset, task.end(), addr),
            Err(TrySendError::Full(_)) => {
                debug!("Peer {} still holds a task, retrying later", addr);
                self.scheduler.dispatch_failed(&addr);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Peer {} is gone, releasing its task", addr);
                self.task_senders.remove(&addr);
                self.scheduler.dispatch_failed(&addr);
            }
        }
    }
}
