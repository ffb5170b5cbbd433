//! Peer session module
//!
//! One task per remote peer: dial, handshake, then download whatever range
//! the supervisor assigns while reporting lifecycle signals back to it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::peer::state::{Bitfield, PeerAddr, PeerEvent, PeerSignal};
use crate::protocol::{read_handshake, read_message, write_handshake, write_message, Handshake, Message};
use crate::storage::{BlockEvent, PieceArray};

/// Timeouts and pipelining limits for peer sessions
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Idle time before a keepalive is sent
    pub keepalive_interval: Duration,
    pub block_size: u32,
    pub max_outstanding: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(50),
            read_timeout: Duration::from_secs(180),
            write_timeout: Duration::from_secs(180),
            keepalive_interval: Duration::from_secs(5),
            block_size: 16 * 1024,
            max_outstanding: 5,
        }
    }
}

/// A contiguous run of whole pieces assigned to one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadRange {
    pub offset: u64,
    pub length: u64,
    pub piece_length: u64,
}

impl DownloadRange {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Piece indices covered by the range
    pub fn pieces(&self) -> std::ops::Range<usize> {
        if self.piece_length == 0 {
            return 0..0;
        }
        let first = (self.offset / self.piece_length) as usize;
        let last = self.end().div_ceil(self.piece_length) as usize;
        first..last
    }
}

/// Request position inside the current task
#[derive(Debug)]
struct TaskCursor {
    next: u64,
    end: u64,
}

/// Everything a session needs, consumed by [`PeerSession::run`]
pub struct PeerSession {
    addr: PeerAddr,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    pieces: Arc<PieceArray>,
    config: SessionConfig,
    events: mpsc::UnboundedSender<PeerEvent>,
    blocks: mpsc::Sender<BlockEvent>,
    tasks: mpsc::Receiver<DownloadRange>,
}

/// Aborts the reader task when the session ends
struct ReaderGuard(JoinHandle<()>);

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl PeerSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        addr: PeerAddr,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        pieces: Arc<PieceArray>,
        config: SessionConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
        blocks: mpsc::Sender<BlockEvent>,
        tasks: mpsc::Receiver<DownloadRange>,
    ) -> Self {
        Self { addr, info_hash, peer_id, pieces, config, events, blocks, tasks }
    }

    /// Run until the connection fails or shutdown; reports `Dead` exactly once
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let addr = self.addr;
        let events = self.events.clone();

        match self.session(shutdown).await {
            Ok(()) => debug!("Session with {} closed", addr),
            Err(e) => warn!("Session with {} failed: {}", addr, e),
        }
        let _ = events.send(PeerEvent::new(addr, PeerSignal::Dead));
    }

    fn signal(&self, signal: PeerSignal) {
        let _ = self.events.send(PeerEvent::new(self.addr, signal));
    }

    async fn connect(&self) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
        let socket_addr = self.addr.to_socket_addr();
        debug!("Connecting to peer: {}", socket_addr);

        let stream = timeout(self.config.connect_timeout, TcpStream::connect(socket_addr))
            .await
            .map_err(|e| {
                debug!("Connection timeout to {}", socket_addr);
                TorrentError::network_error_full("Connection timeout", socket_addr.to_string(), e.to_string())
            })?
            .map_err(|e| {
                debug!("Failed to connect to {}: {}", socket_addr, e);
                TorrentError::network_error_full("Failed to connect", socket_addr.to_string(), e.to_string())
            })?;
        let (mut reader, mut writer) = stream.into_split();

        let ours = Handshake::new(self.info_hash, self.peer_id);
        timeout(self.config.write_timeout, write_handshake(&mut writer, &ours))
            .await
            .map_err(TorrentError::from)?
            .map_err(|e| TorrentError::peer_error_full("Failed to send handshake", self.addr.to_string(), e.to_string()))?;

        let theirs = timeout(self.config.handshake_timeout, read_handshake(&mut reader))
            .await
            .map_err(|e| TorrentError::peer_error_full("Handshake timeout", self.addr.to_string(), e.to_string()))?
            .map_err(|e| TorrentError::peer_error_full("Failed to read handshake", self.addr.to_string(), e.to_string()))?;
        theirs.validate(&self.info_hash)?;

        debug!("Handshake completed with peer: {}", self.addr);
        Ok((reader, writer))
    }

    async fn send(&self, writer: &mut OwnedWriteHalf, message: &Message) -> Result<()> {
        trace!("Sending {:?} to {}", message.message_id(), self.addr);
        timeout(self.config.write_timeout, write_message(writer, message))
            .await
            .map_err(|e| TorrentError::peer_error_full("Write timeout", self.addr.to_string(), e.to_string()))?
            .map_err(|e| TorrentError::peer_error_full("Failed to send message", self.addr.to_string(), e.to_string()))?;
        Ok(())
    }

    async fn session(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let (mut reader, mut writer) = tokio::select! {
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => return Ok(()),
            connected = self.connect() => connected?,
        };

        let first = timeout(self.config.read_timeout, read_message(&mut reader)).await.map_err(TorrentError::from)??;
        let Message::Bitfield { bitfield } = first else {
            return Err(TorrentError::protocol_error_with_source(
                "First message must be a bitfield",
                format!("{:?} from {}", first.message_id(), self.addr),
            ).into());
        };
        self.signal(PeerSignal::Bitfield(Bitfield::from_bytes(bitfield.to_vec())));
        self.send(&mut writer, &Message::Interested).await?;
        info!("Connected to peer {}", self.addr);

        let (inbox_tx, mut inbox) = mpsc::channel::<Result<Message>>(16);
        let read_timeout = self.config.read_timeout;
        let _reader = ReaderGuard(tokio::spawn(async move {
            loop {
                let message = match timeout(read_timeout, read_message(&mut reader)).await {
                    Ok(message) => message,
                    Err(e) => Err(TorrentError::from(e).with_context("Read timeout").into()),
                };
                let failed = message.is_err();
                if inbox_tx.send(message).await.is_err() || failed {
                    break;
                }
            }
        }));

        let mut choked = true;
        let mut task: Option<TaskCursor> = None;
        let mut outstanding: HashSet<(u32, u32)> = HashSet::new();
        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_activity = Instant::now();

        loop {
            if !choked {
                if let Some(cursor) = task.as_mut() {
                    while outstanding.len() < self.config.max_outstanding {
                        let Some((index, begin, length)) = self.next_request(cursor) else {
                            break;
                        };
                        self.send(&mut writer, &Message::Request { index, begin, length }).await?;
                        outstanding.insert((index, begin));
                        last_activity = Instant::now();
                    }
                    if cursor.next >= cursor.end && outstanding.is_empty() {
                        trace!("Peer {} finished its task", self.addr);
                        task = None;
                        self.signal(PeerSignal::Ready);
                    }
                }
            }

            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => return Ok(()),
                message = inbox.recv() => {
                    let message = message.ok_or_else(|| TorrentError::peer_error_with_peer("Connection closed", self.addr.to_string()))??;
                    match message {
                        Message::Choke => {
                            debug!("Choked by {}", self.addr);
                            choked = true;
                            task = None;
                            outstanding.clear();
                            self.drop_queued_tasks();
                            self.signal(PeerSignal::Choke);
                        }
                        Message::Unchoke => {
                            debug!("Unchoked by {}", self.addr);
                            choked = false;
                            task = None;
                            outstanding.clear();
                            self.drop_queued_tasks();
                            self.signal(PeerSignal::Unchoke);
                        }
                        Message::Have { piece_index } => self.signal(PeerSignal::Have(piece_index)),
                        Message::Bitfield { bitfield } => {
                            self.signal(PeerSignal::Bitfield(Bitfield::from_bytes(bitfield.to_vec())));
                        }
                        Message::Piece { index, begin, block } => {
                            outstanding.remove(&(index, begin));
                            last_activity = Instant::now();
                            self.on_piece(index, begin, &block).await?;
                        }
                        other => trace!("Ignoring {:?} from {}", other.message_id(), self.addr),
                    }
                }
                assigned = self.tasks.recv(), if task.is_none() => {
                    let Some(range) = assigned else {
                        debug!("Supervisor dropped task channel for {}", self.addr);
                        return Ok(());
                    };
                    debug!("Peer {} assigned [{}, {})", self.addr, range.offset, range.end());
                    task = Some(TaskCursor { next: range.offset, end: range.end() });
                }
                _ = keepalive.tick() => {
                    if last_activity.elapsed() >= self.config.keepalive_interval {
                        self.send(&mut writer, &Message::KeepAlive).await?;
                        last_activity = Instant::now();
                    }
                }
            }
        }
    }

    /// Discard tasks dispatched before the last choke state change
    fn drop_queued_tasks(&mut self) {
        while let Ok(stale) = self.tasks.try_recv() {
            trace!("Peer {} dropping queued task [{}, {})", self.addr, stale.offset, stale.end());
        }
    }

    /// Next block request for the task, skipping pieces nobody needs anymore
    fn next_request(&self, cursor: &mut TaskCursor) -> Option<(u32, u32, u32)> {
        while cursor.next < cursor.end {
            let index = self.pieces.piece_index(cursor.next);
            let bounds = self.pieces.piece_bounds(index);
            if bounds.is_empty() {
                cursor.next = cursor.end;
                return None;
            }
            if !self.pieces.state(index).is_wanted() {
                cursor.next = bounds.end.min(cursor.end);
                continue;
            }

            let end = (cursor.next + self.config.block_size as u64).min(bounds.end).min(cursor.end);
            let begin = cursor.next - bounds.start;
            let length = end - cursor.next;
            cursor.next = end;
            return Some((index as u32, begin as u32, length as u32));
        }
        None
    }

    async fn on_piece(&self, index: u32, begin: u32, block: &[u8]) -> Result<()> {
        let index = index as usize;
        if index >= self.pieces.piece_count() {
            return Err(TorrentError::protocol_error_with_source(
                "Block for unknown piece",
                format!("piece {} from {}", index, self.addr),
            ).into());
        }
        if !self.pieces.state(index).is_wanted() {
            trace!("Dropping stale block for piece {} from {}", index, self.addr);
            return Ok(());
        }

        if let Err(e) = self.pieces.write_block(index, begin as u64, block) {
            if matches!(e.downcast_ref::<TorrentError>(), Some(TorrentError::ValidationError { .. })) {
                trace!("Dropping stale block for piece {}: {}", index, e);
                return Ok(());
            }
            error!("Bad block from {}: {}", self.addr, e);
            return Err(e);
        }

        let offset = self.pieces.piece_bounds(index).start + begin as u64;
        self.blocks
            .send(BlockEvent { offset, length: block.len() as u64 })
            .await
            .map_err(|_| TorrentError::storage_error("Piece manager is gone"))?;
        Ok(())
    }
}
