use std::collections::BTreeSet;

use swarm_core::{PeerId, lengths::ValidPieceIndex};

use crate::type_aliases::BF;

/// Piece index -> active peers holding it.
///
/// Strictly derived from [`crate::registry::PeerRegistry`]: only the registry
/// calls the mutating methods, within the same critical section as the bitmap
/// change, so `peer ∈ holders(p)` iff the peer is active and has `p`.
#[derive(Debug)]
pub struct PieceAvailabilityIndex {
    holders: Vec<BTreeSet<PeerId>>,
}

impl PieceAvailabilityIndex {
    pub fn new(total_pieces: u32) -> Self {
        Self {
            holders: vec![BTreeSet::new(); total_pieces as usize],
        }
    }

    pub(crate) fn on_bitmap_changed(
        &mut self,
        peer: PeerId,
        added: impl IntoIterator<Item = ValidPieceIndex>,
    ) {
        for piece in added {
            if let Some(set) = self.holders.get_mut(piece.get() as usize) {
                set.insert(peer);
            }
        }
    }

    pub(crate) fn on_peer_removed(&mut self, peer: &PeerId, bitmap: &BF) {
        for piece in bitmap.iter_ones() {
            if let Some(set) = self.holders.get_mut(piece) {
                set.remove(peer);
            }
        }
    }

    pub fn rarity(&self, piece: ValidPieceIndex) -> usize {
        self.holders
            .get(piece.get() as usize)
            .map_or(0, |s| s.len())
    }

    pub fn holders(&self, piece: ValidPieceIndex) -> impl Iterator<Item = &PeerId> {
        self.holders.get(piece.get() as usize).into_iter().flatten()
    }

    pub fn is_held_by(&self, piece: ValidPieceIndex, peer: &PeerId) -> bool {
        self.holders
            .get(piece.get() as usize)
            .is_some_and(|s| s.contains(peer))
    }

    /// Pieces nobody active holds.
    pub fn unavailable_count(&self) -> usize {
        self.holders.iter().filter(|s| s.is_empty()).count()
    }
}
