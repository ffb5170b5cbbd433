//! Transfer statistics
//!
//! Byte counters per piece stage, folded from deltas and published on a
//! watch channel for the tracker, the progress display and completion checks.

use tokio::sync::watch;

use crate::storage::BlockOutcome;

/// Snapshot of where every byte of the transfer currently stands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub total: u64,
    pub not_started: u64,
    /// Received but not yet validated
    pub downloaded: u64,
    pub validated: u64,
    /// Handed to a file worker, not yet confirmed
    pub saving: u64,
    pub saved: u64,
    /// Pieces that failed their hash check
    pub corrupted: u64,
    /// Writes that failed and were requeued
    pub save_failures: u64,
}

impl TransferStats {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            not_started: total,
            ..Default::default()
        }
    }

    /// Bytes still to fetch, as reported to the tracker
    pub fn left(&self) -> u64 {
        self.not_started + self.downloaded
    }

    /// Verified bytes, as reported to the tracker
    pub fn completed(&self) -> u64 {
        self.validated + self.saving + self.saved
    }

    pub fn is_complete(&self) -> bool {
        self.saved >= self.total
    }

    /// Fraction of the transfer on disk, 0.0 to 1.0
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.saved as f64 / self.total as f64
        }
    }

    pub fn apply(&mut self, diff: &StatDiff) {
        fn shift(value: &mut u64, delta: i64) {
            *value = value.saturating_add_signed(delta);
        }
        shift(&mut self.not_started, diff.not_started);
        shift(&mut self.downloaded, diff.downloaded);
        shift(&mut self.validated, diff.validated);
        shift(&mut self.saving, diff.saving);
        shift(&mut self.saved, diff.saved);
        self.corrupted += diff.corrupted;
        self.save_failures += diff.save_failures;
    }
}

/// Signed change to the counters of a [`TransferStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatDiff {
    pub not_started: i64,
    pub downloaded: i64,
    pub validated: i64,
    pub saving: i64,
    pub saved: i64,
    pub corrupted: u64,
    pub save_failures: u64,
}

impl StatDiff {
    /// Counter movement caused by one block arrival
    pub fn from_block(outcome: &BlockOutcome) -> Self {
        match *outcome {
            BlockOutcome::Partial { new_bytes } => StatDiff {
                not_started: -(new_bytes as i64),
                downloaded: new_bytes as i64,
                ..Default::default()
            },
            BlockOutcome::Validated { new_bytes, piece_bytes, .. } => StatDiff {
                not_started: -(new_bytes as i64),
                downloaded: new_bytes as i64 - piece_bytes as i64,
                validated: piece_bytes as i64,
                ..Default::default()
            },
            BlockOutcome::Corrupted { new_bytes, piece_bytes, .. } => {
                let lost = piece_bytes as i64 - new_bytes as i64;
                StatDiff {
                    not_started: lost,
                    downloaded: -lost,
                    corrupted: 1,
                    ..Default::default()
                }
            }
            BlockOutcome::Stale => StatDiff::default(),
        }
    }

    pub fn save_dispatched(len: u64) -> Self {
        StatDiff {
            validated: -(len as i64),
            saving: len as i64,
            ..Default::default()
        }
    }

    pub fn save_succeeded(len: u64) -> Self {
        StatDiff {
            saving: -(len as i64),
            saved: len as i64,
            ..Default::default()
        }
    }

    pub fn save_failed(len: u64) -> Self {
        StatDiff {
            saving: -(len as i64),
            validated: len as i64,
            save_failures: 1,
            ..Default::default()
        }
    }

    /// Bytes found on disk from an earlier session
    pub fn restored(len: u64) -> Self {
        StatDiff {
            not_started: -(len as i64),
            saved: len as i64,
            ..Default::default()
        }
    }
}

/// Owner of the published statistics
#[derive(Debug, Clone)]
pub struct StatsPublisher {
    tx: watch::Sender<TransferStats>,
}

impl StatsPublisher {
    pub fn new(total: u64) -> Self {
        let (tx, _) = watch::channel(TransferStats::new(total));
        Self { tx }
    }

    pub fn apply(&self, diff: StatDiff) {
        self.tx.send_modify(|stats| stats.apply(&diff));
    }

    pub fn snapshot(&self) -> TransferStats {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TransferStats> {
        self.tx.subscribe()
    }
}
