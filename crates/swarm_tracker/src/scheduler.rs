use std::collections::HashMap;

use itertools::Itertools;
use rand::{Rng, seq::IndexedRandom, seq::SliceRandom};
use serde::Serialize;
use swarm_core::{
    PeerId,
    lengths::{Lengths, ValidPieceIndex},
};

use crate::{availability::PieceAvailabilityIndex, registry::PeerRecord, transfer::SessionTable};

/// One scheduling decision: fetch `piece` from `source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduledPiece {
    pub piece: u32,
    pub source: PeerId,
}

/// Rarest-first piece selection with a randomized tie-break.
#[derive(Debug, Clone, Copy)]
pub struct PieceScheduler {
    lengths: Lengths,
    max_fan_out: usize,
}

impl PieceScheduler {
    pub fn new(lengths: Lengths, max_fan_out: usize) -> Self {
        Self {
            lengths,
            max_fan_out,
        }
    }

    /// Up to `want` (piece, source) pairs for `downloader`, rarest pieces first.
    ///
    /// Never fails: when nothing is eligible the result is empty. Sources
    /// picked earlier in the same call count against their fan-out limit.
    pub fn next_pieces(
        &self,
        downloader: &PeerRecord,
        want: usize,
        index: &PieceAvailabilityIndex,
        sessions: &SessionTable,
        rng: &mut impl Rng,
    ) -> Vec<ScheduledPiece> {
        if want == 0 {
            return Vec::new();
        }
        let me = downloader.peer_id;

        let mut candidates: Vec<(ValidPieceIndex, usize)> = downloader
            .bitfield
            .iter_zeros()
            .filter_map(|i| {
                let piece = self.lengths.validate_piece_index(i as u32)?;
                if sessions.is_open(&me, piece) {
                    return None;
                }
                let rarity = index.holders(piece).filter(|h| **h != me).count();
                (rarity > 0).then_some((piece, rarity))
            })
            .collect();

        // Stable sort after a shuffle: ascending rarity, random order within a rarity class.
        candidates.shuffle(rng);
        candidates.sort_by_key(|(_, rarity)| *rarity);

        let mut picked_now: HashMap<PeerId, usize> = HashMap::new();
        let mut result = Vec::with_capacity(want.min(candidates.len()));

        for (piece, _) in candidates {
            if result.len() == want {
                break;
            }
            let eligible = index
                .holders(piece)
                .filter(|h| **h != me)
                .filter(|h| {
                    sessions.fan_out(h) + picked_now.get(*h).copied().unwrap_or(0)
                        < self.max_fan_out
                })
                .copied()
                .collect_vec();
            let preferred = match sessions.failed_sources(&me, piece) {
                Some(failed) if !failed.is_empty() => {
                    let fresh = eligible
                        .iter()
                        .filter(|h| !failed.contains(*h))
                        .copied()
                        .collect_vec();
                    if fresh.is_empty() { eligible } else { fresh }
                }
                _ => eligible,
            };
            let Some(source) = preferred.choose(rng).copied() else {
                continue;
            };
            *picked_now.entry(source).or_default() += 1;
            result.push(ScheduledPiece {
                piece: piece.get(),
                source,
            });
        }
        result
    }
}
