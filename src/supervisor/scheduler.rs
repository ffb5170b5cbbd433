//! Task scheduler
//!
//! Peer bookkeeping and piece claims for the supervisor. Pure state: every
//! method returns the commands the supervisor loop has to carry out.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::peer::{Bitfield, DownloadRange, PeerAddr, PeerEvent, PeerLifecycle, PeerSignal};
use crate::storage::PieceArray;

/// Side effect requested by the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start a session for this address
    Spawn(PeerAddr),
    /// Hand a task to a running session
    Dispatch { addr: PeerAddr, task: DownloadRange },
}

/// Scheduling state owned by the supervisor loop
#[derive(Debug)]
pub struct Scheduler {
    pieces: Arc<PieceArray>,
    task_budget: u64,
    peer_state: HashMap<PeerAddr, PeerLifecycle>,
    bitfields: HashMap<PeerAddr, Bitfield>,
    /// Piece index to the peer currently fetching it
    tasks_peers: HashMap<usize, PeerAddr>,
    peer_tasks: HashMap<PeerAddr, DownloadRange>,
    queue: VecDeque<PeerAddr>,
    /// Free connection slots
    available: usize,
}

impl Scheduler {
    pub fn new(pieces: Arc<PieceArray>, max_peers: usize, task_budget: u64) -> Self {
        Self {
            pieces,
            task_budget,
            peer_state: HashMap::new(),
            bitfields: HashMap::new(),
            tasks_peers: HashMap::new(),
            peer_tasks: HashMap::new(),
            queue: VecDeque::new(),
            available: max_peers,
        }
    }

    pub fn state(&self, addr: &PeerAddr) -> Option<PeerLifecycle> {
        self.peer_state.get(addr).copied()
    }

    pub fn claimed_by(&self, index: usize) -> Option<PeerAddr> {
        self.tasks_peers.get(&index).copied()
    }

    pub fn task_of(&self, addr: &PeerAddr) -> Option<DownloadRange> {
        self.peer_tasks.get(addr).copied()
    }

    /// Pieces the peer has advertised so far
    pub fn bitfield(&self, addr: &PeerAddr) -> Option<&Bitfield> {
        self.bitfields.get(addr)
    }

    pub fn available(&self) -> usize {
        self.available
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Sessions started and not yet dead
    pub fn live_peers(&self) -> usize {
        self.peer_state
            .values()
            .filter(|state| !matches!(state, PeerLifecycle::CouldBeAdded | PeerLifecycle::Dead))
            .count()
    }

    /// A newly discovered address: spawn it if a slot is free, queue it otherwise
    pub fn add_peer(&mut self, addr: PeerAddr) -> Vec<Command> {
        match self.peer_state.get(&addr) {
            None | Some(PeerLifecycle::Dead) => {}
            Some(_) => {
                trace!("Peer {} already known, skipping", addr);
                return Vec::new();
            }
        }

        if self.available > 0 {
            self.available -= 1;
            self.peer_state.insert(addr, PeerLifecycle::Choking);
            debug!("Spawning session for {} ({} slots left)", addr, self.available);
            vec![Command::Spawn(addr)]
        } else {
            self.peer_state.insert(addr, PeerLifecycle::CouldBeAdded);
            self.queue.push_back(addr);
            trace!("Queued peer {} ({} waiting)", addr, self.queue.len());
            Vec::new()
        }
    }

    pub fn on_event(&mut self, event: PeerEvent) -> Vec<Command> {
        let addr = event.addr;
        match self.peer_state.get(&addr) {
            None | Some(PeerLifecycle::Dead) | Some(PeerLifecycle::CouldBeAdded) => {
                trace!("Ignoring {:?} from inactive peer {}", event.signal, addr);
                return Vec::new();
            }
            Some(_) => {}
        }

        match event.signal {
            PeerSignal::Bitfield(bitfield) => {
                let known = self.bitfields.entry(addr).or_default();
                known.merge(&bitfield);
                known.truncate(self.pieces.piece_count());
                self.assign_if_waiting(addr)
            }
            PeerSignal::Have(index) if index as usize >= self.pieces.piece_count() => {
                debug!("Peer {} announced piece {} out of range, ignoring", addr, index);
                Vec::new()
            }
            PeerSignal::Have(index) => {
                self.bitfields.entry(addr).or_default().set(index as usize);
                self.assign_if_waiting(addr)
            }
            PeerSignal::Choke => {
                self.peer_state.insert(addr, PeerLifecycle::Choking);
                Vec::new()
            }
            PeerSignal::Unchoke | PeerSignal::Ready => {
                self.release(&addr);
                self.peer_state.insert(addr, PeerLifecycle::Waiting);
                self.assign(addr).into_iter().collect()
            }
            PeerSignal::Dead => self.on_dead(addr),
        }
    }

    fn on_dead(&mut self, addr: PeerAddr) -> Vec<Command> {
        self.release(&addr);
        self.bitfields.remove(&addr);
        self.peer_state.insert(addr, PeerLifecycle::Dead);
        self.available += 1;
        info!("Peer {} is dead ({} slots free)", addr, self.available);

        let mut commands = Vec::new();
        while self.available > 0 {
            let Some(next) = self.queue.pop_front() else {
                break;
            };
            if self.peer_state.get(&next) != Some(&PeerLifecycle::CouldBeAdded) {
                continue;
            }
            self.available -= 1;
            self.peer_state.insert(next, PeerLifecycle::Choking);
            debug!("Promoting queued peer {}", next);
            commands.push(Command::Spawn(next));
        }

        // Released pieces may now be assignable to idle peers.
        commands.extend(self.assign_waiting());
        commands
    }

    /// Retry every waiting peer, in address order
    pub fn assign_waiting(&mut self) -> Vec<Command> {
        let mut waiting: Vec<PeerAddr> = self
            .peer_state
            .iter()
            .filter(|(_, state)| **state == PeerLifecycle::Waiting)
            .map(|(addr, _)| *addr)
            .collect();
        waiting.sort();
        waiting.into_iter().filter_map(|addr| self.assign(addr)).collect()
    }

    /// A dispatch could not be delivered; undo it
    pub fn dispatch_failed(&mut self, addr: &PeerAddr) {
        self.release(addr);
        if self.peer_state.get(addr) == Some(&PeerLifecycle::Downloading) {
            self.peer_state.insert(*addr, PeerLifecycle::Waiting);
        }
    }

    fn assign_if_waiting(&mut self, addr: PeerAddr) -> Vec<Command> {
        if self.peer_state.get(&addr) == Some(&PeerLifecycle::Waiting) {
            self.assign(addr).into_iter().collect()
        } else {
            Vec::new()
        }
    }

    fn assign(&mut self, addr: PeerAddr) -> Option<Command> {
        let task = self.find_task(addr)?;
        self.peer_state.insert(addr, PeerLifecycle::Downloading);
        Some(Command::Dispatch { addr, task })
    }

    /// Claim the first contiguous run of eligible pieces for `addr`.
    ///
    /// A piece is eligible when nobody holds it, it still needs data and the
    /// peer advertises it. The run grows until it reaches the task budget,
    /// always taking at least one piece.
    pub fn find_task(&mut self, addr: PeerAddr) -> Option<DownloadRange> {
        self.release(&addr);
        let bitfield = self.bitfields.get(&addr)?;
        let mut run: Option<(usize, usize)> = None;
        let mut total = 0u64;

        for index in 0..self.pieces.piece_count() {
            let eligible = !self.tasks_peers.contains_key(&index)
                && self.pieces.state(index).is_wanted()
                && bitfield.has(index);

            if eligible {
                let (first, _) = run.unwrap_or((index, index));
                run = Some((first, index + 1));
                total += self.pieces.piece_size(index);
                if total >= self.task_budget {
                    break;
                }
            } else if run.is_some() {
                break;
            }
        }

        let (first, last) = run?;
        for index in first..last {
            self.tasks_peers.insert(index, addr);
        }
        let offset = self.pieces.piece_bounds(first).start;
        let task = DownloadRange {
            offset,
            length: self.pieces.piece_bounds(last - 1).end - offset,
            piece_length: self.pieces.piece_length(),
        };
        debug!("Assigned pieces {}..{} to {}", first, last, addr);
        self.peer_tasks.insert(addr, task);
        Some(task)
    }

    /// Drop every claim held by `addr`
    pub fn release(&mut self, addr: &PeerAddr) {
        if self.peer_tasks.remove(addr).is_some() {
            self.tasks_peers.retain(|_, owner| owner != addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sha1::{Digest, Sha1};

    const PIECE: u64 = 16384;

    fn pieces(count: usize) -> Arc<PieceArray> {
        Arc::new(PieceArray::from_parts(PIECE, vec![0..PIECE * count as u64], vec![[0u8; 20]; count]))
    }

    fn peer(n: u8) -> PeerAddr {
        PeerAddr([10, 0, 0, n, 0x1a, 0xe1])
    }

    fn bitfield_of(indices: &[usize]) -> Bitfield {
        let mut bitfield = Bitfield::default();
        for &i in indices {
            bitfield.set(i);
        }
        bitfield
    }

    fn connect(scheduler: &mut Scheduler, addr: PeerAddr, have: &[usize]) {
        assert_eq!(scheduler.add_peer(addr), vec![Command::Spawn(addr)]);
        scheduler.on_event(PeerEvent::new(addr, PeerSignal::Bitfield(bitfield_of(have))));
    }

    #[test]
    fn test_find_task_first_fit_within_budget() {
        let mut scheduler = Scheduler::new(pieces(8), 5, 2 * PIECE);
        connect(&mut scheduler, peer(1), &[0, 1, 2, 3, 4, 5, 6, 7]);
        connect(&mut scheduler, peer(2), &[0, 1, 2, 3, 4, 5, 6, 7]);

        let first = scheduler.find_task(peer(1)).unwrap();
        assert_eq!(first, DownloadRange { offset: 0, length: 2 * PIECE, piece_length: PIECE });
        let second = scheduler.find_task(peer(2)).unwrap();
        assert_eq!(second.offset, 2 * PIECE);
        assert_eq!(second.pieces(), 2..4);
        assert_eq!(scheduler.claimed_by(1), Some(peer(1)));
        assert_eq!(scheduler.claimed_by(3), Some(peer(2)));
    }

    #[test]
    fn test_find_task_stops_at_gap() {
        let mut scheduler = Scheduler::new(pieces(6), 5, 100 * PIECE);
        connect(&mut scheduler, peer(1), &[1, 2, 4, 5]);
        connect(&mut scheduler, peer(2), &[1, 2, 4, 5]);

        assert_eq!(scheduler.find_task(peer(1)).unwrap().pieces(), 1..3);
        assert_eq!(scheduler.find_task(peer(2)).unwrap().pieces(), 4..6);
        assert!(scheduler.find_task(peer(3)).is_none());
    }

    #[test]
    fn test_new_task_replaces_old_claims() {
        let mut scheduler = Scheduler::new(pieces(4), 5, PIECE);
        connect(&mut scheduler, peer(1), &[0, 1]);
        assert_eq!(scheduler.find_task(peer(1)).unwrap().pieces(), 0..1);
        assert_eq!(scheduler.find_task(peer(1)).unwrap().pieces(), 0..1);
        assert_eq!(scheduler.claimed_by(1), None);
    }

    #[test]
    fn test_find_task_takes_one_piece_over_budget() {
        let mut scheduler = Scheduler::new(pieces(3), 5, 1);
        connect(&mut scheduler, peer(1), &[0, 1, 2]);
        assert_eq!(scheduler.find_task(peer(1)).unwrap().pieces(), 0..1);
    }

    #[test]
    fn test_skips_validated_pieces() {
        let zeros = vec![0u8; PIECE as usize];
        let mut hasher = Sha1::new();
        hasher.update(&zeros);
        let hash: [u8; 20] = hasher.finalize().into();
        let array = Arc::new(PieceArray::from_parts(PIECE, vec![0..3 * PIECE], vec![hash; 3]));
        array.write_block(0, 0, &zeros).unwrap();
        array.on_block_downloaded(0, PIECE);

        let mut scheduler = Scheduler::new(array.clone(), 5, 100 * PIECE);
        connect(&mut scheduler, peer(1), &[0, 1, 2]);
        assert_eq!(scheduler.find_task(peer(1)).unwrap().pieces(), 1..3);
    }

    #[test]
    fn test_dead_peer_releases_claims() {
        let mut scheduler = Scheduler::new(pieces(6), 5, 100 * PIECE);
        connect(&mut scheduler, peer(1), &[3, 4]);
        connect(&mut scheduler, peer(2), &[3, 4]);

        let commands = scheduler.on_event(PeerEvent::new(peer(1), PeerSignal::Unchoke));
        let expected = DownloadRange { offset: 3 * PIECE, length: 2 * PIECE, piece_length: PIECE };
        assert_eq!(commands, vec![Command::Dispatch { addr: peer(1), task: expected }]);
        assert_eq!(scheduler.state(&peer(1)), Some(PeerLifecycle::Downloading));
        assert!(scheduler.find_task(peer(2)).is_none());

        scheduler.on_event(PeerEvent::new(peer(1), PeerSignal::Dead));
        assert_eq!(scheduler.claimed_by(3), None);
        assert_eq!(scheduler.claimed_by(4), None);
        assert_eq!(scheduler.find_task(peer(2)).unwrap(), expected);
    }

    #[test]
    fn test_dead_peer_work_goes_to_waiting_peer() {
        let mut scheduler = Scheduler::new(pieces(2), 5, 100 * PIECE);
        connect(&mut scheduler, peer(1), &[0, 1]);
        connect(&mut scheduler, peer(2), &[0, 1]);
        scheduler.on_event(PeerEvent::new(peer(1), PeerSignal::Unchoke));
        assert!(scheduler.on_event(PeerEvent::new(peer(2), PeerSignal::Unchoke)).is_empty());
        assert_eq!(scheduler.state(&peer(2)), Some(PeerLifecycle::Waiting));

        let commands = scheduler.on_event(PeerEvent::new(peer(1), PeerSignal::Dead));
        assert!(matches!(commands.as_slice(), [Command::Dispatch { addr, .. }] if *addr == peer(2)));
    }

    #[test]
    fn test_choke_keeps_claims_until_unchoke() {
        let mut scheduler = Scheduler::new(pieces(4), 5, 2 * PIECE);
        connect(&mut scheduler, peer(1), &[0, 1, 2, 3]);
        scheduler.on_event(PeerEvent::new(peer(1), PeerSignal::Unchoke));

        assert!(scheduler.on_event(PeerEvent::new(peer(1), PeerSignal::Choke)).is_empty());
        assert_eq!(scheduler.state(&peer(1)), Some(PeerLifecycle::Choking));
        assert_eq!(scheduler.claimed_by(0), Some(peer(1)));

        let commands = scheduler.on_event(PeerEvent::new(peer(1), PeerSignal::Unchoke));
        let task = DownloadRange { offset: 0, length: 2 * PIECE, piece_length: PIECE };
        assert_eq!(commands, vec![Command::Dispatch { addr: peer(1), task }]);
    }

    #[test]
    fn test_have_wakes_waiting_peer() {
        let mut scheduler = Scheduler::new(pieces(4), 5, PIECE);
        connect(&mut scheduler, peer(1), &[]);
        assert!(scheduler.on_event(PeerEvent::new(peer(1), PeerSignal::Unchoke)).is_empty());

        let commands = scheduler.on_event(PeerEvent::new(peer(1), PeerSignal::Have(2)));
        let task = DownloadRange { offset: 2 * PIECE, length: PIECE, piece_length: PIECE };
        assert_eq!(commands, vec![Command::Dispatch { addr: peer(1), task }]);
    }

    #[test]
    fn test_out_of_range_have_is_ignored() {
        let mut scheduler = Scheduler::new(pieces(4), 5, PIECE);
        connect(&mut scheduler, peer(1), &[]);
        assert!(scheduler.on_event(PeerEvent::new(peer(1), PeerSignal::Unchoke)).is_empty());

        assert!(scheduler.on_event(PeerEvent::new(peer(1), PeerSignal::Have(u32::MAX))).is_empty());
        assert!(scheduler.on_event(PeerEvent::new(peer(1), PeerSignal::Have(4))).is_empty());
        assert!(scheduler.bitfield(&peer(1)).unwrap().as_bytes().len() <= 1);
        assert_eq!(scheduler.bitfield(&peer(1)).unwrap().count(), 0);
        assert_eq!(scheduler.state(&peer(1)), Some(PeerLifecycle::Waiting));
    }

    #[test]
    fn test_oversized_bitfield_is_truncated() {
        let mut scheduler = Scheduler::new(pieces(4), 5, PIECE);
        assert_eq!(scheduler.add_peer(peer(1)), vec![Command::Spawn(peer(1))]);
        let oversized = Bitfield::from_bytes(vec![0xff; 1 << 16]);
        scheduler.on_event(PeerEvent::new(peer(1), PeerSignal::Bitfield(oversized)));

        let known = scheduler.bitfield(&peer(1)).unwrap();
        assert_eq!(known.as_bytes(), &[0xf0]);
        assert_eq!(known.count(), 4);
    }

    #[test]
    fn test_connection_budget_and_queue() {
        let mut scheduler = Scheduler::new(pieces(1), 2, PIECE);
        assert_eq!(scheduler.add_peer(peer(1)), vec![Command::Spawn(peer(1))]);
        assert_eq!(scheduler.add_peer(peer(2)), vec![Command::Spawn(peer(2))]);
        assert!(scheduler.add_peer(peer(3)).is_empty());
        assert!(scheduler.add_peer(peer(3)).is_empty());
        assert_eq!(scheduler.queued(), 1);
        assert_eq!(scheduler.available(), 0);

        let commands = scheduler.on_event(PeerEvent::new(peer(1), PeerSignal::Dead));
        assert_eq!(commands, vec![Command::Spawn(peer(3))]);
        assert_eq!(scheduler.available(), 0);
        assert_eq!(scheduler.live_peers(), 2);

        // A duplicate death must not free a second slot.
        assert!(scheduler.on_event(PeerEvent::new(peer(1), PeerSignal::Dead)).is_empty());
        assert_eq!(scheduler.available(), 0);
    }

    #[test]
    fn test_dead_peer_can_be_added_again() {
        let mut scheduler = Scheduler::new(pieces(1), 1, PIECE);
        scheduler.add_peer(peer(1));
        scheduler.on_event(PeerEvent::new(peer(1), PeerSignal::Dead));
        assert_eq!(scheduler.add_peer(peer(1)), vec![Command::Spawn(peer(1))]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Find(u8),
        Unchoke(u8),
        Dead(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u8..4).prop_map(Op::Find),
            (1u8..4).prop_map(Op::Unchoke),
            (1u8..4).prop_map(Op::Dead),
        ]
    }

    proptest! {
        #[test]
        fn prop_no_piece_claimed_twice(
            masks in proptest::collection::vec(any::<u16>(), 3),
            budget in 1u64..6,
            ops in proptest::collection::vec(op(), 1..60),
        ) {
            let mut scheduler = Scheduler::new(pieces(16), 3, budget * PIECE);
            for (i, mask) in masks.iter().enumerate() {
                let have: Vec<usize> = (0..16).filter(|bit| mask & (1 << bit) != 0).collect();
                connect(&mut scheduler, peer(i as u8 + 1), &have);
            }

            for op in ops {
                match op {
                    Op::Find(n) => { scheduler.find_task(peer(n)); }
                    Op::Unchoke(n) => { scheduler.on_event(PeerEvent::new(peer(n), PeerSignal::Unchoke)); }
                    Op::Dead(n) => { scheduler.on_event(PeerEvent::new(peer(n), PeerSignal::Dead)); }
                }

                let mut owners: HashMap<usize, PeerAddr> = HashMap::new();
                for n in 1..4u8 {
                    if let Some(task) = scheduler.task_of(&peer(n)) {
                        for index in task.pieces() {
                            prop_assert!(owners.insert(index, peer(n)).is_none());
                        }
                    }
                }
                for (index, owner) in scheduler.tasks_peers.iter() {
                    prop_assert_eq!(owners.get(index), Some(owner));
                }
            }
        }
    }
}
