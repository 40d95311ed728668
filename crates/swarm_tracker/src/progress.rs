use std::{collections::HashMap, time::Instant};

use serde::Serialize;
use swarm_core::{PeerId, lengths::Lengths, rate_window::RateWindow};

use crate::registry::{PeerRecord, iter_held};

/// Derived per-peer progress. Recomputed on demand, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub pieces_complete: u32,
    pub total_pieces: u32,
    pub percent: f64,
    pub download_bps: u64,
    pub upload_bps: u64,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    pub left_bytes: u64,
}

impl ProgressSnapshot {
    /// The value progress notifications are deduplicated on.
    pub fn percent_floor(&self) -> u32 {
        self.percent.floor() as u32
    }

    pub fn speed(&self) -> (u64, u64) {
        (self.download_bps, self.upload_bps)
    }

    pub fn is_complete(&self) -> bool {
        self.pieces_complete == self.total_pieces
    }
}

#[derive(Debug)]
struct PeerRates {
    down: RateWindow,
    up: RateWindow,
}

/// Rolling transfer rates and cumulative byte counters per peer.
#[derive(Debug)]
pub struct ProgressAggregator {
    // Every peer starts from a copy of this one.
    empty: RateWindow,
    rates: HashMap<PeerId, PeerRates>,
}

impl ProgressAggregator {
    pub fn new(empty: RateWindow) -> Self {
        Self {
            empty,
            rates: HashMap::new(),
        }
    }

    fn rates_mut(&mut self, peer: PeerId) -> &mut PeerRates {
        let empty = &self.empty;
        self.rates.entry(peer).or_insert_with(|| PeerRates {
            down: empty.clone(),
            up: empty.clone(),
        })
    }

    /// Credits `downloader`'s download window and `source`'s upload window.
    pub fn on_piece_verified(
        &mut self,
        downloader: PeerId,
        source: PeerId,
        byte_count: u64,
        at: Instant,
    ) {
        self.rates_mut(downloader).down.add(byte_count, at);
        self.rates_mut(source).up.add(byte_count, at);
    }

    /// (download, upload) bps right now. Zero for peers that never transferred.
    pub fn speed(&mut self, peer: &PeerId, now: Instant) -> (u64, u64) {
        match self.rates.get_mut(peer) {
            Some(r) => (r.down.bps(now), r.up.bps(now)),
            None => (0, 0),
        }
    }

    pub fn snapshot(
        &mut self,
        record: &PeerRecord,
        lengths: &Lengths,
        now: Instant,
    ) -> ProgressSnapshot {
        let total_pieces = lengths.total_pieces();
        let pieces_complete = record.pieces_held();
        let have_bytes: u64 = iter_held(lengths, &record.bitfield)
            .map(|p| lengths.piece_length(p) as u64)
            .sum();
        let (download_bps, upload_bps) = self.speed(&record.peer_id, now);
        let (downloaded_bytes, uploaded_bytes) = self
            .rates
            .get(&record.peer_id)
            .map_or((0, 0), |r| (r.down.total_bytes(), r.up.total_bytes()));

        ProgressSnapshot {
            pieces_complete,
            total_pieces,
            percent: pieces_complete as f64 / total_pieces as f64 * 100.,
            download_bps,
            upload_bps,
            downloaded_bytes,
            uploaded_bytes,
            left_bytes: lengths.total_length().saturating_sub(have_bytes),
        }
    }

    pub fn forget(&mut self, peer: &PeerId) {
        self.rates.remove(peer);
    }
}
