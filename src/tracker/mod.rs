//! Tracker module
//!
//! Transfer statistics and the periodic announce loop feeding the supervisor
//! with peer addresses.

pub mod client;
pub mod stats;

pub use client::{AnnounceEvent, AnnounceRequest, AnnounceResponse, HttpTrackerClient, TrackerClient};
pub use stats::{StatDiff, StatsPublisher, TransferStats};

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::peer::PeerAddr;

/// Announces until shutdown, forwarding every returned peer
pub struct Announcer {
    client: Arc<dyn TrackerClient>,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    stats: watch::Receiver<TransferStats>,
    peers: mpsc::UnboundedSender<PeerAddr>,
    /// Wait used after a failed announce
    retry_interval: Duration,
}

impl Announcer {
    pub fn new(
        client: Arc<dyn TrackerClient>,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        port: u16,
        stats: watch::Receiver<TransferStats>,
        peers: mpsc::UnboundedSender<PeerAddr>,
    ) -> Self {
        Self {
            client,
            info_hash,
            peer_id,
            port,
            stats,
            peers,
            retry_interval: Duration::from_secs(60),
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    fn request(&self, event: AnnounceEvent) -> AnnounceRequest {
        let stats = *self.stats.borrow();
        AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: 0,
            downloaded: stats.completed(),
            left: stats.left(),
            event,
        }
    }

    /// Announce once; returns the delay before the next announce
    async fn announce(&self, event: AnnounceEvent) -> Duration {
        match self.client.announce(&self.request(event)).await {
            Ok(response) => {
                info!("Tracker {} returned {} peers", self.client.tracker_url(), response.peers.len());
                for peer in response.peers {
                    if self.peers.send(peer).is_err() {
                        debug!("Peer channel closed");
                        break;
                    }
                }
                response.interval
            }
            Err(e) => {
                warn!("Announce to {} failed: {}", self.client.tracker_url(), e);
                self.retry_interval
            }
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut stats = self.stats.clone();
        let mut completion_reported = stats.borrow().is_complete();
        let mut event = AnnounceEvent::Started;

        loop {
            let wait = self.announce(event).await;
            event = AnnounceEvent::None;

            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                _ = tokio::time::sleep(wait) => {}
                complete = async { stats.wait_for(|s| s.is_complete()).await.is_ok() }, if !completion_reported => {
                    completion_reported = true;
                    if complete {
                        event = AnnounceEvent::Completed;
                    }
                }
            }
        }

        let stopped = tokio::time::timeout(Duration::from_secs(5), self.client.announce(&self.request(AnnounceEvent::Stopped))).await;
        if !matches!(stopped, Ok(Ok(_))) {
            debug!("Stopped announce to {} did not complete", self.client.tracker_url());
        }
        Ok(())
    }
}
