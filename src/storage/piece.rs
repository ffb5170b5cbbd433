//! Piece state machine
//!
//! Owns every piece buffer, tracks which blocks of each piece have arrived,
//! validates completed pieces and keeps the transfer-wide `to_save` and
//! `saved` range sets.

use std::ops::Range;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use tracing::{debug, error, info, trace, warn};

use crate::error::TorrentError;
use crate::storage::range_set::RangeSet;
use crate::torrent::TorrentMetadata;

/// Resting state of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceState {
    #[default]
    NotStarted,
    InProgress,
    Validated,
    Saved,
}

impl PieceState {
    /// Pieces still worth requesting from peers
    pub fn is_wanted(&self) -> bool {
        matches!(self, PieceState::NotStarted | PieceState::InProgress)
    }
}

/// What a block arrival did to its piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Piece still incomplete
    Partial { new_bytes: u64 },
    /// Piece complete and its hash matched
    Validated { index: usize, new_bytes: u64, piece_bytes: u64 },
    /// Piece complete but the hash did not match; it restarts from scratch
    Corrupted { index: usize, new_bytes: u64, piece_bytes: u64 },
    /// Piece was already validated or reset; the block is ignored
    Stale,
}

/// A validated byte range ready for a positioned write
#[derive(Debug, Clone)]
pub struct SaveRange {
    /// Index of the owning file in layout order
    pub file_index: usize,
    /// Offset of `range.start` inside the file
    pub file_offset: u64,
    /// Absolute byte range in the transfer
    pub range: Range<u64>,
    /// Bytes to write
    pub data: Bytes,
}

#[derive(Debug, Default)]
struct PieceSlot {
    state: PieceState,
    buffer: Option<Vec<u8>>,
    /// Piece-relative offsets already written
    downloaded: RangeSet,
}

/// Compare `data` against an expected SHA1 digest
pub fn validate(data: &[u8], expected: &[u8; 20]) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest: [u8; 20] = hasher.finalize().into();
    digest == *expected
}

/// All pieces of one transfer plus the global save bookkeeping
#[derive(Debug)]
pub struct PieceArray {
    piece_length: u64,
    total_length: u64,
    hashes: Vec<[u8; 20]>,
    file_ranges: Vec<Range<u64>>,
    pieces: Vec<Mutex<PieceSlot>>,
    to_save: Mutex<RangeSet>,
    saved: Mutex<RangeSet>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PieceArray {
    pub fn new(metadata: &TorrentMetadata) -> Self {
        Self::from_parts(metadata.piece_length, metadata.file_ranges(), metadata.pieces.clone())
    }

    /// Build from a piece length, absolute file ranges and piece hashes
    pub fn from_parts(piece_length: u64, file_ranges: Vec<Range<u64>>, hashes: Vec<[u8; 20]>) -> Self {
        let total_length = file_ranges.last().map(|r| r.end).unwrap_or(0);
        debug!(
            "Creating piece array: {} pieces of {} bytes, {} total, {} files",
            hashes.len(),
            piece_length,
            total_length,
            file_ranges.len()
        );
        let pieces = (0..hashes.len()).map(|_| Mutex::new(PieceSlot::default())).collect();
        Self {
            piece_length,
            total_length,
            hashes,
            file_ranges,
            pieces,
            to_save: Mutex::new(RangeSet::new()),
            saved: Mutex::new(RangeSet::new()),
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Absolute byte range of a piece
    pub fn piece_bounds(&self, index: usize) -> Range<u64> {
        let start = (index as u64 * self.piece_length).min(self.total_length);
        let end = (start + self.piece_length).min(self.total_length);
        start..end
    }

    /// Length of a piece; only the last one may be short
    pub fn piece_size(&self, index: usize) -> u64 {
        let bounds = self.piece_bounds(index);
        bounds.end - bounds.start
    }

    pub fn piece_index(&self, offset: u64) -> usize {
        (offset / self.piece_length) as usize
    }

    pub fn state(&self, index: usize) -> PieceState {
        self.pieces.get(index).map(|slot| lock(slot).state).unwrap_or(PieceState::Saved)
    }

    /// Run `f` on the buffer of a piece, allocating it on first use.
    ///
    /// Fails for pieces already validated or saved; callers holding a stale
    /// block should drop it.
    pub fn update_piece<F, R>(&self, index: usize, f: F) -> Result<R>
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let size = self.piece_size(index) as usize;
        let slot = self.pieces.get(index).ok_or_else(|| {
            TorrentError::validation_error_with_field(format!("piece {} out of range", index), "index")
        })?;
        let mut slot = lock(slot);

        if !slot.state.is_wanted() {
            return Err(TorrentError::validation_error_with_field(
                format!("piece {} is already {:?}", index, slot.state),
                "state",
            ).into());
        }

        if slot.buffer.is_none() {
            trace!("Allocating {} byte buffer for piece {}", size, index);
            slot.buffer = Some(vec![0u8; size]);
            slot.state = PieceState::InProgress;
        }

        let buffer = slot.buffer.as_mut().ok_or_else(|| TorrentError::validation_error("piece buffer vanished"))?;
        Ok(f(buffer))
    }

    /// Copy a received block into its piece buffer
    pub fn write_block(&self, index: usize, begin: u64, block: &[u8]) -> Result<()> {
        let size = self.piece_size(index);
        let end = begin + block.len() as u64;
        if index >= self.pieces.len() || end > size {
            return Err(TorrentError::protocol_error_with_source(
                "Block outside piece bounds",
                format!("piece {} [{}, {}) of {}", index, begin, end, size),
            ).into());
        }
        self.update_piece(index, |buf| buf[begin as usize..end as usize].copy_from_slice(block))
    }

    /// Record `[offset, offset + length)` as written and validate the piece
    /// once every byte of it is present.
    pub fn on_block_downloaded(&self, offset: u64, length: u64) -> BlockOutcome {
        let index = self.piece_index(offset);
        let Some(slot) = self.pieces.get(index) else {
            warn!("Block at offset {} lies beyond the last piece", offset);
            return BlockOutcome::Stale;
        };
        let bounds = self.piece_bounds(index);
        let piece_bytes = bounds.end - bounds.start;
        let begin = offset - bounds.start;
        let end = (begin + length).min(piece_bytes);

        let outcome = {
            let mut slot = lock(slot);
            if slot.state != PieceState::InProgress {
                debug!("Dropping block for piece {} in state {:?}", index, slot.state);
                return BlockOutcome::Stale;
            }

            let before = slot.downloaded.covered();
            slot.downloaded.insert(begin, end);
            let new_bytes = slot.downloaded.covered() - before;

            if !slot.downloaded.contains(0, piece_bytes) {
                return BlockOutcome::Partial { new_bytes };
            }

            let matches = slot
                .buffer
                .as_deref()
                .map(|buf| validate(buf, &self.hashes[index]))
                .unwrap_or(false);

            if matches {
                slot.state = PieceState::Validated;
                BlockOutcome::Validated { index, new_bytes, piece_bytes }
            } else {
                slot.state = PieceState::NotStarted;
                slot.buffer = None;
                slot.downloaded.clear();
                BlockOutcome::Corrupted { index, new_bytes, piece_bytes }
            }
        };

        match outcome {
            BlockOutcome::Validated { .. } => {
                debug!("Piece {} validated", index);
                lock(&self.to_save).insert(bounds.start, bounds.end);
            }
            BlockOutcome::Corrupted { .. } => {
                warn!("Piece {} failed hash check, restarting it", index);
            }
            _ => {}
        }
        outcome
    }

    pub fn has_pending_saves(&self) -> bool {
        !lock(&self.to_save).is_empty()
    }

    /// Take the lowest validated range, clipped to the file that owns it,
    /// and gather its bytes from the piece buffers.
    pub fn next_save(&self) -> Result<Option<SaveRange>> {
        let (file_index, file_offset, range) = {
            let mut to_save = lock(&self.to_save);
            let Some(first) = to_save.pop_first() else {
                return Ok(None);
            };

            let Some(file_index) = self.file_ranges.iter().position(|f| f.start <= first.start && first.start < f.end)
            else {
                error!("No file owns byte {}", first.start);
                to_save.insert(first.start, first.end);
                return Err(TorrentError::validation_error_with_field(
                    format!("no file owns save range [{}, {})", first.start, first.end),
                    "to_save",
                ).into());
            };

            let file = &self.file_ranges[file_index];
            let end = first.end.min(file.end);
            if end < first.end {
                to_save.insert(end, first.end);
            }
            (file_index, first.start - file.start, first.start..end)
        };

        let data = match self.gather(range.clone()) {
            Ok(data) => data,
            Err(e) => {
                lock(&self.to_save).insert(range.start, range.end);
                return Err(e);
            }
        };

        trace!("Prepared save of [{}, {}) into file {} at {}", range.start, range.end, file_index, file_offset);
        Ok(Some(SaveRange {
            file_index,
            file_offset,
            range,
            data,
        }))
    }

    fn gather(&self, range: Range<u64>) -> Result<Bytes> {
        let mut payload = BytesMut::with_capacity((range.end - range.start) as usize);
        let mut cursor = range.start;
        while cursor < range.end {
            let index = self.piece_index(cursor);
            let bounds = self.piece_bounds(index);
            let stop = range.end.min(bounds.end);
            let slot = lock(&self.pieces[index]);
            let buffer = match (&slot.state, &slot.buffer) {
                (PieceState::Validated, Some(buf)) => buf,
                (state, _) => {
                    error!("Piece {} has no validated buffer (state {:?})", index, state);
                    return Err(TorrentError::validation_error_with_field(
                        format!("piece {} queued for save without a validated buffer", index),
                        "buffer",
                    ).into());
                }
            };
            let from = (cursor - bounds.start) as usize;
            let to = (stop - bounds.start) as usize;
            payload.extend_from_slice(&buffer[from..to]);
            cursor = stop;
        }
        Ok(payload.freeze())
    }

    /// Confirm a written range; returns pieces that became fully saved.
    pub fn save_completed(&self, range: Range<u64>) -> Vec<usize> {
        let finished: Vec<usize> = {
            let mut saved = lock(&self.saved);
            saved.insert(range.start, range.end);
            let first = self.piece_index(range.start);
            let last = self.piece_index(range.end.saturating_sub(1));
            (first..=last.min(self.pieces.len().saturating_sub(1)))
                .filter(|&i| {
                    let b = self.piece_bounds(i);
                    saved.contains(b.start, b.end)
                })
                .collect()
        };

        let mut newly_saved = Vec::new();
        for index in finished {
            let mut slot = lock(&self.pieces[index]);
            if slot.state != PieceState::Saved {
                slot.state = PieceState::Saved;
                slot.buffer = None;
                newly_saved.push(index);
            }
        }
        if !newly_saved.is_empty() {
            debug!("Pieces saved: {:?}", newly_saved);
        }
        newly_saved
    }

    /// Put a range whose write failed back in the queue
    pub fn save_failed(&self, range: Range<u64>) {
        debug!("Requeueing [{}, {})", range.start, range.end);
        lock(&self.to_save).insert(range.start, range.end);
    }

    /// Mark every piece fully covered by `saved` as already on disk.
    ///
    /// Returns the number of bytes restored.
    pub fn restore_saved(&self, ranges: &RangeSet) -> u64 {
        let mut restored = 0;
        let mut saved = lock(&self.saved);
        for index in 0..self.pieces.len() {
            let bounds = self.piece_bounds(index);
            if !ranges.contains(bounds.start, bounds.end) {
                continue;
            }
            let mut slot = lock(&self.pieces[index]);
            slot.state = PieceState::Saved;
            slot.buffer = None;
            slot.downloaded.clear();
            saved.insert(bounds.start, bounds.end);
            restored += bounds.end - bounds.start;
        }
        info!("Restored {} bytes from previous session", restored);
        restored
    }

    pub fn to_save(&self) -> RangeSet {
        lock(&self.to_save).clone()
    }

    pub fn saved(&self) -> RangeSet {
        lock(&self.saved).clone()
    }

    /// True once every byte of the transfer is on disk
    pub fn is_complete(&self) -> bool {
        self.total_length == 0 || lock(&self.saved).contains(0, self.total_length)
    }
}
