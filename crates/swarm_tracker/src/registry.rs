use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use serde::Serialize;
use swarm_core::{
    PeerId,
    lengths::{Lengths, ValidPieceIndex},
};
use tracing::{debug, trace};

use crate::{
    Error,
    availability::PieceAvailabilityIndex,
    type_aliases::{BF, PeerAddr},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Active,
    // Missed heartbeats. Not a source, but still registered.
    Stale,
    // Terminal. Only ever seen on records handed out by leave() or a sweep.
    Departed,
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PeerState::Active => "active",
            PeerState::Stale => "stale",
            PeerState::Departed => "departed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addr: PeerAddr,
    pub bitfield: BF,
    pub joined_at: Instant,
    pub last_seen: Instant,
    pub state: PeerState,
}

impl PeerRecord {
    pub fn has_piece(&self, piece: ValidPieceIndex) -> bool {
        self.bitfield
            .get(piece.get() as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    pub fn pieces_held(&self) -> u32 {
        self.bitfield.count_ones() as u32
    }

    pub fn has_full_torrent(&self) -> bool {
        self.bitfield.all()
    }

    pub fn is_active(&self) -> bool {
        self.state == PeerState::Active
    }
}

#[derive(Debug, Default)]
pub struct HeartbeatOutcome {
    /// Pieces that weren't in the bitmap before.
    pub added: Vec<ValidPieceIndex>,
    /// The peer was stale and is active again.
    pub revived: bool,
}

#[derive(Debug, Default)]
pub struct StaleSweep {
    pub stale: Vec<PeerId>,
    pub departed: Vec<PeerRecord>,
}

impl StaleSweep {
    pub fn is_empty(&self) -> bool {
        self.stale.is_empty() && self.departed.is_empty()
    }
}

/// Authoritative per-torrent peer table.
///
/// Every method that changes a bitmap or a peer state takes the availability
/// index and updates it before returning.
#[derive(Debug)]
pub struct PeerRegistry {
    lengths: Lengths,
    peers: HashMap<PeerId, PeerRecord>,
}

/// Pieces set in a bitfield that was sized from `lengths`.
pub(crate) fn iter_held<'a>(
    lengths: &'a Lengths,
    bitfield: &'a BF,
) -> impl Iterator<Item = ValidPieceIndex> + 'a {
    bitfield
        .iter_ones()
        .filter_map(|i| lengths.validate_piece_index(i as u32))
}

impl PeerRegistry {
    pub fn new(lengths: Lengths) -> Self {
        Self {
            lengths,
            peers: HashMap::new(),
        }
    }

    fn make_bitfield(&self, pieces: &[ValidPieceIndex]) -> BF {
        let mut bf = BF::repeat(false, self.lengths.total_pieces() as usize);
        for piece in pieces {
            bf.set(piece.get() as usize, true);
        }
        bf
    }

    pub fn join(
        &mut self,
        peer_id: PeerId,
        addr: PeerAddr,
        pieces: &[ValidPieceIndex],
        now: Instant,
        index: &mut PieceAvailabilityIndex,
    ) -> crate::Result<()> {
        if let Some(existing) = self.peers.get(&peer_id) {
            if existing.is_active() {
                return Err(Error::DuplicatePeer(peer_id));
            }
            // A stale peer re-joining starts over. Stale peers aren't indexed.
            debug!(peer = %peer_id.short(), "stale peer re-joined, resetting its bitmap");
        }
        let bitfield = self.make_bitfield(pieces);
        index.on_bitmap_changed(peer_id, iter_held(&self.lengths, &bitfield));
        self.peers.insert(
            peer_id,
            PeerRecord {
                peer_id,
                addr,
                bitfield,
                joined_at: now,
                last_seen: now,
                state: PeerState::Active,
            },
        );
        Ok(())
    }

    pub fn heartbeat(
        &mut self,
        peer_id: &PeerId,
        delta: &[ValidPieceIndex],
        now: Instant,
        index: &mut PieceAvailabilityIndex,
    ) -> crate::Result<HeartbeatOutcome> {
        let record = self
            .peers
            .get_mut(peer_id)
            .ok_or(Error::UnknownPeer(*peer_id))?;
        record.last_seen = now;

        let mut outcome = HeartbeatOutcome::default();
        for piece in delta {
            let i = piece.get() as usize;
            if !record.bitfield[i] {
                record.bitfield.set(i, true);
                outcome.added.push(*piece);
            }
        }

        match record.state {
            PeerState::Active => {
                index.on_bitmap_changed(*peer_id, outcome.added.iter().copied());
            }
            PeerState::Stale => {
                debug!(peer = %peer_id.short(), "stale peer is back");
                record.state = PeerState::Active;
                outcome.revived = true;
                index.on_bitmap_changed(*peer_id, iter_held(&self.lengths, &record.bitfield));
            }
            PeerState::Departed => unreachable!("departed peers are never stored"),
        }
        trace!(peer = %peer_id.short(), added = outcome.added.len(), "heartbeat");
        Ok(outcome)
    }

    /// Adds a verified piece to the downloader's bitmap. Returns false if it
    /// was already there.
    pub fn mark_piece_verified(
        &mut self,
        peer_id: &PeerId,
        piece: ValidPieceIndex,
        index: &mut PieceAvailabilityIndex,
    ) -> crate::Result<bool> {
        let record = self
            .peers
            .get_mut(peer_id)
            .ok_or(Error::UnknownPeer(*peer_id))?;
        if record.has_piece(piece) {
            return Ok(false);
        }
        record.bitfield.set(piece.get() as usize, true);
        if record.is_active() {
            index.on_bitmap_changed(*peer_id, [piece]);
        }
        Ok(true)
    }

    pub fn leave(
        &mut self,
        peer_id: &PeerId,
        index: &mut PieceAvailabilityIndex,
    ) -> crate::Result<PeerRecord> {
        let mut record = self
            .peers
            .remove(peer_id)
            .ok_or(Error::UnknownPeer(*peer_id))?;
        if record.is_active() {
            index.on_peer_removed(peer_id, &record.bitfield);
        }
        record.state = PeerState::Departed;
        Ok(record)
    }

    /// Peers silent for longer than `timeout` become stale, and those silent
    /// for longer than `timeout + grace` are removed as departed.
    pub fn sweep_stale(
        &mut self,
        now: Instant,
        timeout: Duration,
        grace: Duration,
        index: &mut PieceAvailabilityIndex,
    ) -> StaleSweep {
        let mut sweep = StaleSweep::default();
        let departed_after = timeout + grace;

        let departed_ids: Vec<PeerId> = self
            .peers
            .values()
            .filter(|r| now.saturating_duration_since(r.last_seen) > departed_after)
            .map(|r| r.peer_id)
            .collect();
        for peer_id in departed_ids {
            if let Ok(record) = self.leave(&peer_id, index) {
                debug!(peer = %peer_id.short(), "peer departed after prolonged staleness");
                sweep.departed.push(record);
            }
        }

        for record in self.peers.values_mut() {
            if record.is_active() && now.saturating_duration_since(record.last_seen) > timeout {
                debug!(peer = %record.peer_id.short(), "peer missed heartbeats, marking stale");
                record.state = PeerState::Stale;
                index.on_peer_removed(&record.peer_id, &record.bitfield);
                sweep.stale.push(record.peer_id);
            }
        }
        sweep
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Sorted, so that equal sets compare equal.
    pub fn active_peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .values()
            .filter(|r| r.is_active())
            .map(|r| r.peer_id)
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use super::*;

    fn addr(id: u8) -> PeerAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, id)), 6881)
    }

    fn setup(pieces: u32) -> (PeerRegistry, PieceAvailabilityIndex, Lengths) {
        let lengths = Lengths::new(pieces as u64 * 16, 16).unwrap();
        (
            PeerRegistry::new(lengths),
            PieceAvailabilityIndex::new(pieces),
            lengths,
        )
    }

    #[test]
    fn test_duplicate_join_rejected() {
        let (mut reg, mut index, l) = setup(4);
        let p = PeerId::new([1; 20]);
        let now = Instant::now();
        reg.join(p, addr(1), &[l.validate_piece_index(0).unwrap()], now, &mut index)
            .unwrap();
        assert!(matches!(
            reg.join(p, addr(1), &[], now, &mut index),
            Err(Error::DuplicatePeer(_))
        ));
    }

    #[test]
    fn test_heartbeat_unknown_peer() {
        let (mut reg, mut index, _) = setup(4);
        assert!(matches!(
            reg.heartbeat(&PeerId::new([1; 20]), &[], Instant::now(), &mut index),
            Err(Error::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_heartbeat_empty_delta_only_touches_last_seen() {
        let (mut reg, mut index, l) = setup(4);
        let p = PeerId::new([1; 20]);
        let t0 = Instant::now();
        let p1 = l.validate_piece_index(1).unwrap();
        reg.join(p, addr(1), &[p1], t0, &mut index).unwrap();
        let before = reg.get(&p).unwrap().bitfield.clone();

        let t1 = t0 + Duration::from_secs(3);
        let outcome = reg.heartbeat(&p, &[], t1, &mut index).unwrap();
        assert!(outcome.added.is_empty());
        let rec = reg.get(&p).unwrap();
        assert_eq!(rec.bitfield, before);
        assert_eq!(rec.last_seen, t1);
        assert_eq!(index.rarity(p1), 1);

        // Re-announcing a held piece is a no-op too.
        let outcome = reg.heartbeat(&p, &[p1], t1, &mut index).unwrap();
        assert!(outcome.added.is_empty());
        assert_eq!(index.rarity(p1), 1);
    }

    #[test]
    fn test_stale_then_departed() {
        let (mut reg, mut index, l) = setup(2);
        let p = PeerId::new([1; 20]);
        let p0 = l.validate_piece_index(0).unwrap();
        let t0 = Instant::now();
        reg.join(p, addr(1), &[p0], t0, &mut index).unwrap();

        let timeout = Duration::from_secs(10);
        let grace = Duration::from_secs(20);

        let sweep = reg.sweep_stale(t0 + Duration::from_secs(10), timeout, grace, &mut index);
        assert!(sweep.is_empty());

        let sweep = reg.sweep_stale(t0 + Duration::from_secs(11), timeout, grace, &mut index);
        assert_eq!(sweep.stale, vec![p]);
        assert_eq!(reg.get(&p).unwrap().state, PeerState::Stale);
        assert_eq!(index.rarity(p0), 0);
        assert!(reg.active_peer_ids().is_empty());

        let sweep = reg.sweep_stale(t0 + Duration::from_secs(31), timeout, grace, &mut index);
        assert_eq!(sweep.departed.len(), 1);
        assert_eq!(sweep.departed[0].state, PeerState::Departed);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_stale_peer_revived_by_heartbeat() {
        let (mut reg, mut index, l) = setup(2);
        let p = PeerId::new([1; 20]);
        let p0 = l.validate_piece_index(0).unwrap();
        let p1 = l.validate_piece_index(1).unwrap();
        let t0 = Instant::now();
        reg.join(p, addr(1), &[p0], t0, &mut index).unwrap();
        reg.sweep_stale(
            t0 + Duration::from_secs(5),
            Duration::from_secs(1),
            Duration::from_secs(60),
            &mut index,
        );
        assert_eq!(index.rarity(p0), 0);

        let outcome = reg
            .heartbeat(&p, &[p1], t0 + Duration::from_secs(6), &mut index)
            .unwrap();
        assert!(outcome.revived);
        assert_eq!(index.rarity(p0), 1);
        assert_eq!(index.rarity(p1), 1);
    }

    #[test]
    fn test_stale_peer_rejoin_resets_bitmap() {
        let (mut reg, mut index, l) = setup(2);
        let p = PeerId::new([1; 20]);
        let p0 = l.validate_piece_index(0).unwrap();
        let t0 = Instant::now();
        reg.join(p, addr(1), &[p0], t0, &mut index).unwrap();
        reg.sweep_stale(
            t0 + Duration::from_secs(5),
            Duration::from_secs(1),
            Duration::from_secs(60),
            &mut index,
        );
        reg.join(p, addr(2), &[], t0 + Duration::from_secs(6), &mut index)
            .unwrap();
        let rec = reg.get(&p).unwrap();
        assert_eq!(rec.pieces_held(), 0);
        assert_eq!(rec.addr, addr(2));
        assert!(rec.is_active());
        assert_eq!(index.rarity(p0), 0);
    }

    #[test]
    fn test_leave_returns_final_bitmap() {
        let (mut reg, mut index, l) = setup(3);
        let p = PeerId::new([1; 20]);
        let pieces = [
            l.validate_piece_index(0).unwrap(),
            l.validate_piece_index(2).unwrap(),
        ];
        reg.join(p, addr(1), &pieces, Instant::now(), &mut index)
            .unwrap();
        let rec = reg.leave(&p, &mut index).unwrap();
        assert_eq!(rec.state, PeerState::Departed);
        assert_eq!(rec.pieces_held(), 2);
        assert_eq!(index.unavailable_count(), 3);
        assert!(matches!(reg.leave(&p, &mut index), Err(Error::UnknownPeer(_))));
    }
}
