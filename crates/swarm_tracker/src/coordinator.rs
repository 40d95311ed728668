use std::{collections::HashMap, sync::Arc, time::Instant};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rand::{SeedableRng, rngs::StdRng, seq::IndexedRandom};
use serde::Serialize;
use swarm_core::{
    Id20, PeerId, TorrentDescriptor, lengths::ValidPieceIndex, rate_window::RateWindow,
};
use tracing::{debug, info, trace, warn};

use crate::{
    Error,
    availability::PieceAvailabilityIndex,
    events::{NotificationKind, SwarmEventBus},
    messages::{InboundEvent, Response, TransferReport},
    options::TrackerOptions,
    progress::{ProgressAggregator, ProgressSnapshot},
    registry::{PeerRecord, PeerRegistry},
    scheduler::{PieceScheduler, ScheduledPiece},
    timed_lock::{TimedGuard, timeit},
    transfer::{FailureReason, FinishedTransfer, SessionTable, TransferSession},
    type_aliases::PeerAddr,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SwarmStats {
    pub active: usize,
    pub stale: usize,
    pub seeders: usize,
    pub leechers: usize,
    pub open_sessions: usize,
    pub completed_transfers: u64,
    pub failed_transfers: u64,
    pub unavailable_pieces: usize,
}

/// Announce-style peer list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeerListEntry {
    pub peer_id: PeerId,
    pub addr: PeerAddr,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub stale: Vec<PeerId>,
    pub departed: Vec<PeerId>,
    pub expired: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.stale.is_empty() && self.departed.is_empty() && self.expired == 0
    }
}

// Everything mutable about one swarm. Only touched under TrackerCoordinator::locked.
struct SwarmLocked {
    registry: PeerRegistry,
    index: PieceAvailabilityIndex,
    sessions: SessionTable,
    progress: ProgressAggregator,

    // Last emitted values, for no-op suppression.
    emitted_peers: Vec<PeerId>,
    emitted_percent: HashMap<PeerId, u32>,
    emitted_speed: HashMap<PeerId, (u64, u64)>,

    rng: StdRng,
    emptied_at: Option<Instant>,
}

type Pending = Vec<NotificationKind>;

impl SwarmLocked {
    fn check_peers(&mut self, out: &mut Pending) {
        let peers = self.registry.active_peer_ids();
        if peers != self.emitted_peers {
            self.emitted_peers = peers.clone();
            out.push(NotificationKind::PeersChanged { peers });
        }
    }

    fn check_progress(
        &mut self,
        descriptor: &TorrentDescriptor,
        peer: &PeerId,
        now: Instant,
        out: &mut Pending,
    ) {
        let Some(record) = self.registry.get(peer) else {
            return;
        };
        let snap = self.progress.snapshot(record, descriptor.lengths(), now);
        let percent = snap.percent_floor();
        if self.emitted_percent.insert(*peer, percent) != Some(percent) {
            out.push(NotificationKind::ProgressChanged {
                peer: *peer,
                percent,
            });
        }
        self.check_speed_value(peer, snap.speed(), out);
    }

    fn check_speed(&mut self, peer: &PeerId, now: Instant, out: &mut Pending) {
        let speed = self.progress.speed(peer, now);
        self.check_speed_value(peer, speed, out);
    }

    fn check_speed_value(&mut self, peer: &PeerId, speed: (u64, u64), out: &mut Pending) {
        let prev = self.emitted_speed.get(peer).copied().unwrap_or((0, 0));
        if prev != speed {
            self.emitted_speed.insert(*peer, speed);
            out.push(NotificationKind::SpeedChanged {
                peer: *peer,
                download_bps: speed.0,
                upload_bps: speed.1,
            });
        }
    }

    // Requests and transfer reports count as liveness, like an empty heartbeat.
    fn refresh(&mut self, peer: &PeerId, now: Instant, out: &mut Pending) -> crate::Result<()> {
        let outcome = self.registry.heartbeat(peer, &[], now, &mut self.index)?;
        if outcome.revived {
            self.check_peers(out);
        }
        Ok(())
    }

    // Cleanup after a peer left or was swept as departed. The record is
    // already gone from the registry and the index.
    fn on_departed(&mut self, peer: &PeerId, now: Instant) {
        for f in self.sessions.cancel_sourced_by(peer) {
            debug!(
                downloader = %f.session.downloader.short(),
                piece = f.session.piece.get(),
                outcome = ?f.outcome,
                "source departed mid-transfer"
            );
        }
        let cancelled = self.sessions.cancel_downloaded_by(peer);
        if !cancelled.is_empty() {
            debug!(
                peer = %peer.short(),
                count = cancelled.len(),
                "dropped sessions of departed downloader"
            );
        }
        self.progress.forget(peer);
        self.emitted_percent.remove(peer);
        self.emitted_speed.remove(peer);
        if self.registry.is_empty() {
            self.emptied_at.get_or_insert(now);
        }
    }
}

fn validate_pieces(
    descriptor: &TorrentDescriptor,
    pieces: &[u32],
) -> crate::Result<Vec<ValidPieceIndex>> {
    pieces
        .iter()
        .map(|p| {
            descriptor
                .validate_piece_index(*p)
                .ok_or(Error::InvalidPieceIndex(*p))
        })
        .collect()
}

/// The façade of one torrent's swarm.
///
/// Registry, availability index, open transfer sessions and progress windows
/// live behind a single lock, so every event is applied atomically. The
/// notifications an event produces are published before the lock is
/// released, so subscribers see them in the order the events were applied.
pub struct TrackerCoordinator {
    descriptor: Arc<TorrentDescriptor>,
    options: Arc<TrackerOptions>,
    scheduler: PieceScheduler,
    locked: RwLock<SwarmLocked>,
    bus: SwarmEventBus,
}

impl TrackerCoordinator {
    pub(crate) fn new(
        descriptor: Arc<TorrentDescriptor>,
        options: Arc<TrackerOptions>,
        empty_rate_window: RateWindow,
        bus: SwarmEventBus,
        rng_seed: Option<u64>,
    ) -> Self {
        let lengths = *descriptor.lengths();
        let rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let locked = SwarmLocked {
            registry: PeerRegistry::new(lengths),
            index: PieceAvailabilityIndex::new(lengths.total_pieces()),
            sessions: SessionTable::new(options.max_attempts),
            progress: ProgressAggregator::new(empty_rate_window),
            emitted_peers: Vec::new(),
            emitted_percent: HashMap::new(),
            emitted_speed: HashMap::new(),
            rng,
            emptied_at: None,
        };
        Self {
            scheduler: PieceScheduler::new(lengths, options.max_fan_out),
            descriptor,
            options,
            locked: RwLock::new(locked),
            bus,
        }
    }

    pub fn content_id(&self) -> Id20 {
        self.descriptor.content_id()
    }

    pub fn descriptor(&self) -> &Arc<TorrentDescriptor> {
        &self.descriptor
    }

    /// Per-swarm notifications. The tracker-wide bus carries them too.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<NotificationKind> {
        self.bus.subscribe()
    }

    fn lock_read(&self, reason: &'static str) -> TimedGuard<RwLockReadGuard<'_, SwarmLocked>> {
        TimedGuard::new(timeit(reason, || self.locked.read()), reason)
    }

    fn lock_write(&self, reason: &'static str) -> TimedGuard<RwLockWriteGuard<'_, SwarmLocked>> {
        TimedGuard::new(timeit(reason, || self.locked.write()), reason)
    }

    // Runs `f` under the write lock and publishes what it queued while still
    // holding it. Broadcast sends never block.
    fn with_write<R>(
        &self,
        reason: &'static str,
        f: impl FnOnce(&mut SwarmLocked, &mut Pending) -> R,
    ) -> R {
        let mut pending = Pending::new();
        let mut g = self.lock_write(reason);
        let result = f(&mut **g, &mut pending);
        for n in pending {
            self.bus.emit(n);
        }
        drop(g);
        result
    }

    pub fn peer_join(
        &self,
        peer_id: PeerId,
        addr: PeerAddr,
        pieces: &[u32],
        now: Instant,
    ) -> crate::Result<()> {
        self.with_write("peer_join", |g, out| {
            let pieces = validate_pieces(&self.descriptor, pieces)?;
            g.registry.join(peer_id, addr, &pieces, now, &mut g.index)?;
            g.emptied_at = None;
            info!(peer = %peer_id.short(), %addr, pieces = pieces.len(), "peer joined");
            g.check_peers(out);
            g.check_progress(&self.descriptor, &peer_id, now, out);
            Ok(())
        })
    }

    pub fn heartbeat(&self, peer_id: &PeerId, delta: &[u32], now: Instant) -> crate::Result<()> {
        self.with_write("heartbeat", |g, out| {
            let delta = validate_pieces(&self.descriptor, delta)?;
            let outcome = g.registry.heartbeat(peer_id, &delta, now, &mut g.index)?;
            if outcome.revived {
                g.check_peers(out);
            }
            if !outcome.added.is_empty() {
                g.check_progress(&self.descriptor, peer_id, now, out);
            }
            Ok(())
        })
    }

    pub fn peer_leave(&self, peer_id: &PeerId, now: Instant) -> crate::Result<PeerRecord> {
        self.with_write("peer_leave", |g, out| {
            let record = g.registry.leave(peer_id, &mut g.index)?;
            info!(peer = %peer_id.short(), pieces = record.pieces_held(), "peer left");
            g.on_departed(peer_id, now);
            g.check_peers(out);
            Ok(record)
        })
    }

    /// Schedules up to `count` pieces for `peer_id` and opens a session for
    /// each of them.
    pub fn request_pieces(
        &self,
        peer_id: &PeerId,
        count: usize,
        now: Instant,
    ) -> crate::Result<Vec<ScheduledPiece>> {
        self.with_write("request_pieces", |g, out| {
            g.refresh(peer_id, now, out)?;
            let record = g.registry.get(peer_id).ok_or(Error::UnknownPeer(*peer_id))?;
            g.sessions.begin_pass(peer_id);
            let scheduled =
                self.scheduler
                    .next_pieces(record, count, &g.index, &g.sessions, &mut g.rng);
            let deadline = now + self.options.request_timeout;
            for s in &scheduled {
                let piece = self
                    .descriptor
                    .validate_piece_index(s.piece)
                    .ok_or(Error::InvalidPieceIndex(s.piece))?;
                g.sessions.open(*peer_id, piece, s.source, now, deadline)?;
            }
            if scheduled.is_empty() {
                trace!(peer = %peer_id.short(), count, "no eligible pieces");
            } else {
                debug!(peer = %peer_id.short(), scheduled = scheduled.len(), "scheduled pieces");
            }
            Ok(scheduled)
        })
    }

    /// The source's answer to a scheduled request.
    pub fn piece_request_result(
        &self,
        downloader: &PeerId,
        piece: u32,
        accepted: bool,
        now: Instant,
    ) -> crate::Result<()> {
        let piece = self
            .descriptor
            .validate_piece_index(piece)
            .ok_or(Error::InvalidPieceIndex(piece))?;
        self.with_write("piece_request_result", |g, _| {
            if accepted {
                g.sessions
                    .accept(downloader, piece, now + self.options.transfer_timeout)?;
            } else {
                g.sessions.fail(downloader, piece, FailureReason::Rejected)?;
            }
            Ok(())
        })
    }

    /// Ends the open session of (`downloader`, `piece`).
    ///
    /// A missing hash with `success` is taken as verified by the peer itself.
    pub fn report_piece_result(
        &self,
        downloader: &PeerId,
        piece: u32,
        success: bool,
        byte_count: u64,
        hash: Option<Id20>,
        now: Instant,
    ) -> crate::Result<TransferReport> {
        let piece = self
            .descriptor
            .validate_piece_index(piece)
            .ok_or(Error::InvalidPieceIndex(piece))?;
        let expected_len = self.descriptor.piece_length(piece);

        let failure = if !success {
            Some(FailureReason::TransferError)
        } else if byte_count != expected_len as u64 {
            Some(FailureReason::LengthMismatch {
                expected: expected_len,
                actual: byte_count,
            })
        } else if hash.is_some_and(|h| h != self.descriptor.piece_hash(piece)) {
            Some(FailureReason::HashMismatch)
        } else {
            None
        };

        self.with_write("report_piece_result", |g, out| {
            // A downloader that already left has no open sessions either.
            if g.registry.get(downloader).is_some() {
                g.refresh(downloader, now, out)?;
            }
            let finished: FinishedTransfer = match failure {
                Some(reason) => {
                    let f = g.sessions.fail(downloader, piece, reason)?;
                    if reason == FailureReason::HashMismatch {
                        warn!(
                            downloader = %downloader.short(),
                            source = %f.session.source.short(),
                            piece = piece.get(),
                            "piece hash mismatch"
                        );
                    }
                    f
                }
                None => {
                    let f = g.sessions.verify(downloader, piece)?;
                    g.registry.mark_piece_verified(downloader, piece, &mut g.index)?;
                    g.progress
                        .on_piece_verified(*downloader, f.session.source, byte_count, now);
                    trace!(
                        downloader = %downloader.short(),
                        source = %f.session.source.short(),
                        piece = piece.get(),
                        "piece verified"
                    );
                    g.check_progress(&self.descriptor, downloader, now, out);
                    g.check_speed(&f.session.source, now, out);
                    f
                }
            };
            Ok(TransferReport {
                piece: piece.get(),
                source: finished.session.source,
                attempt: finished.session.attempt,
                state: finished.session.state,
                outcome: finished.outcome,
            })
        })
    }

    /// Staleness, session deadlines and rate decay. Called periodically.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        self.with_write("sweep", |g, out| {
            let mut report = SweepReport::default();
            let stale = g.registry.sweep_stale(
                now,
                self.options.heartbeat_timeout,
                self.options.departure_grace,
                &mut g.index,
            );
            for record in &stale.departed {
                g.on_departed(&record.peer_id, now);
                report.departed.push(record.peer_id);
            }
            if !stale.is_empty() {
                g.check_peers(out);
            }
            report.stale = stale.stale;

            let expired = g.sessions.expire(now);
            for f in &expired {
                debug!(
                    downloader = %f.session.downloader.short(),
                    source = %f.session.source.short(),
                    piece = f.session.piece.get(),
                    state = ?f.session.state,
                    "session deadline expired"
                );
            }
            report.expired = expired.len();

            let tracked: Vec<PeerId> = g.emitted_speed.keys().copied().collect();
            for peer in tracked {
                g.check_speed(&peer, now, out);
            }

            if g.registry.is_empty() {
                g.emptied_at.get_or_insert(now);
            }
            report
        })
    }

    /// Whether the swarm has been empty for longer than the idle grace.
    pub fn is_idle(&self, now: Instant) -> bool {
        let g = self.lock_read("is_idle");
        g.registry.is_empty()
            && g.emptied_at
                .is_some_and(|t| now.saturating_duration_since(t) >= self.options.idle_swarm_grace)
    }

    pub fn snapshot(&self, peer_id: &PeerId, now: Instant) -> crate::Result<ProgressSnapshot> {
        let mut g = self.lock_write("snapshot");
        let g = &mut **g;
        let record = g.registry.get(peer_id).ok_or(Error::UnknownPeer(*peer_id))?;
        Ok(g.progress.snapshot(record, self.descriptor.lengths(), now))
    }

    /// Up to `max` other active peers, chosen at random. `max` is capped by
    /// the configured response size.
    pub fn peer_list(&self, peer_id: &PeerId, max: usize) -> crate::Result<Vec<PeerListEntry>> {
        let mut g = self.lock_write("peer_list");
        let g = &mut **g;
        if g.registry.get(peer_id).is_none() {
            return Err(Error::UnknownPeer(*peer_id));
        }
        let others: Vec<PeerListEntry> = g
            .registry
            .iter()
            .filter(|r| r.is_active() && r.peer_id != *peer_id)
            .map(|r| PeerListEntry {
                peer_id: r.peer_id,
                addr: r.addr,
            })
            .collect();
        let max = max.min(self.options.max_peers_in_response);
        Ok(others.choose_multiple(&mut g.rng, max).copied().collect())
    }

    pub fn stats(&self) -> SwarmStats {
        let g = self.lock_read("stats");
        let mut stats = SwarmStats {
            open_sessions: g.sessions.open_count(),
            completed_transfers: g.sessions.verified_total(),
            failed_transfers: g.sessions.failed_total(),
            unavailable_pieces: g.index.unavailable_count(),
            ..Default::default()
        };
        for r in g.registry.iter() {
            if !r.is_active() {
                stats.stale += 1;
                continue;
            }
            stats.active += 1;
            if r.has_full_torrent() {
                stats.seeders += 1;
            } else {
                stats.leechers += 1;
            }
        }
        stats
    }

    /// Copies of the currently open transfer sessions.
    pub fn open_sessions(&self) -> Vec<TransferSession> {
        self.lock_read("open_sessions")
            .sessions
            .iter_open()
            .cloned()
            .collect()
    }

    pub fn peer_count(&self) -> usize {
        self.lock_read("peer_count").registry.len()
    }

    pub fn handle(&self, event: InboundEvent, now: Instant) -> crate::Result<Response> {
        match event {
            InboundEvent::PeerJoin {
                peer_id,
                addr,
                pieces,
                ..
            } => self.peer_join(peer_id, addr, &pieces, now).map(|_| Response::Ack),
            InboundEvent::Heartbeat { peer_id, delta, .. } => {
                self.heartbeat(&peer_id, &delta, now).map(|_| Response::Ack)
            }
            InboundEvent::PeerLeave { peer_id, .. } => {
                self.peer_leave(&peer_id, now).map(|_| Response::Ack)
            }
            InboundEvent::RequestPieces { peer_id, count, .. } => self
                .request_pieces(&peer_id, count, now)
                .map(|pieces| Response::Scheduled { pieces }),
            InboundEvent::PieceRequestResult {
                downloader,
                piece,
                accepted,
                ..
            } => self
                .piece_request_result(&downloader, piece, accepted, now)
                .map(|_| Response::Ack),
            InboundEvent::ReportPieceResult {
                downloader,
                piece,
                success,
                byte_count,
                hash,
                ..
            } => self
                .report_piece_result(&downloader, piece, success, byte_count, hash, now)
                .map(Response::Transfer),
        }
    }

    /// Panics if the availability index or the fan-out counters drifted from
    /// the registry and session table.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        let g = self.lock_read("assert_consistent");
        let lengths = self.descriptor.lengths();
        for piece in lengths.iter_piece_indices() {
            for record in g.registry.iter() {
                assert_eq!(
                    g.index.is_held_by(piece, &record.peer_id),
                    record.is_active() && record.has_piece(piece),
                    "peer {:?} piece {}",
                    record.peer_id,
                    piece
                );
            }
            for holder in g.index.holders(piece) {
                assert!(g.registry.get(holder).is_some_and(|r| r.is_active()));
            }
        }
        let mut fan_out: HashMap<PeerId, usize> = HashMap::new();
        for s in g.sessions.iter_open() {
            assert!(s.state.is_open());
            *fan_out.entry(s.source).or_default() += 1;
        }
        for (source, count) in fan_out {
            assert_eq!(g.sessions.fan_out(&source), count);
        }
    }
}

impl std::fmt::Debug for TrackerCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackerCoordinator")
            .field("content_id", &self.content_id())
            .finish_non_exhaustive()
    }
}
