//! Per-(downloader, piece) transfer sessions.
//!
//! ```text
//! Requested --accept--> InFlight --verified--> Verified
//!     |                    |
//!     +---expired/reject---+---mismatch/error/expired--> Failed
//! ```
//!
//! Verified and Failed are terminal. A terminal session leaves the open table
//! for good; a retry is a brand new session with `attempt + 1`.

use std::{
    collections::{BTreeSet, HashMap},
    time::Instant,
};

use serde::Serialize;
use swarm_core::{PeerId, lengths::ValidPieceIndex};
use tracing::{debug, trace};

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    HashMismatch,
    LengthMismatch { expected: u32, actual: u64 },
    Rejected,
    TransferError,
    DeadlineExpired,
    SourceDeparted,
    DownloaderDeparted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Requested,
    InFlight,
    Verified,
    Failed(FailureReason),
}

impl TransferState {
    pub fn is_open(&self) -> bool {
        matches!(self, TransferState::Requested | TransferState::InFlight)
    }
}

#[derive(Debug, Clone)]
pub struct TransferSession {
    pub downloader: PeerId,
    pub piece: ValidPieceIndex,
    pub source: PeerId,
    pub state: TransferState,
    pub started_at: Instant,
    pub deadline: Instant,
    pub attempt: u32,
}

impl TransferSession {
    fn new(
        downloader: PeerId,
        piece: ValidPieceIndex,
        source: PeerId,
        now: Instant,
        deadline: Instant,
        attempt: u32,
    ) -> Self {
        Self {
            downloader,
            piece,
            source,
            state: TransferState::Requested,
            started_at: now,
            deadline,
            attempt,
        }
    }

    fn accept(&mut self, deadline: Instant) -> bool {
        match self.state {
            TransferState::Requested => {
                self.state = TransferState::InFlight;
                self.deadline = deadline;
                true
            }
            // Duplicate acknowledgement.
            TransferState::InFlight => false,
            TransferState::Verified | TransferState::Failed(_) => {
                unreachable!("terminal sessions are not kept in the open table")
            }
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.state.is_open() && now >= self.deadline
    }
}

/// What the caller should do about the piece after a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    Verified,
    /// Failed, another session may be scheduled.
    Retry,
    /// Failed `max_attempts` times in a row for this downloader. The next
    /// scheduling pass starts over with a fresh source.
    Unobtainable,
}

#[derive(Debug, Clone)]
pub struct FinishedTransfer {
    pub session: TransferSession,
    pub outcome: TransferOutcome,
}

#[derive(Debug, Default, Clone)]
struct AttemptHistory {
    attempts: u32,
    failed_sources: BTreeSet<PeerId>,
    exhausted: bool,
}

type SessionKey = (PeerId, ValidPieceIndex);

/// Open sessions plus the bookkeeping the scheduler needs: per-source fan-out
/// and per-(downloader, piece) failure history.
#[derive(Debug)]
pub struct SessionTable {
    max_attempts: u32,
    open: HashMap<SessionKey, TransferSession>,
    fan_out: HashMap<PeerId, usize>,
    history: HashMap<SessionKey, AttemptHistory>,
    verified_total: u64,
    failed_total: u64,
}

impl SessionTable {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            open: HashMap::new(),
            fan_out: HashMap::new(),
            history: HashMap::new(),
            verified_total: 0,
            failed_total: 0,
        }
    }

    pub fn is_open(&self, downloader: &PeerId, piece: ValidPieceIndex) -> bool {
        self.open.contains_key(&(*downloader, piece))
    }

    pub fn fan_out(&self, source: &PeerId) -> usize {
        self.fan_out.get(source).copied().unwrap_or(0)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn verified_total(&self) -> u64 {
        self.verified_total
    }

    pub fn failed_total(&self) -> u64 {
        self.failed_total
    }

    pub fn failed_sources(
        &self,
        downloader: &PeerId,
        piece: ValidPieceIndex,
    ) -> Option<&BTreeSet<PeerId>> {
        self.history
            .get(&(*downloader, piece))
            .map(|h| &h.failed_sources)
    }

    /// Called at the start of every scheduling pass for `downloader`: pieces
    /// that were reported unobtainable get a fresh attempt budget.
    pub fn begin_pass(&mut self, downloader: &PeerId) {
        for ((d, piece), h) in self.history.iter_mut() {
            if d == downloader && h.exhausted {
                trace!(piece = piece.get(), "resetting attempts of unobtainable piece");
                h.exhausted = false;
                h.attempts = 0;
            }
        }
    }

    pub fn open(
        &mut self,
        downloader: PeerId,
        piece: ValidPieceIndex,
        source: PeerId,
        now: Instant,
        deadline: Instant,
    ) -> crate::Result<&TransferSession> {
        use std::collections::hash_map::Entry;

        let attempt = self
            .history
            .get(&(downloader, piece))
            .map_or(0, |h| h.attempts)
            + 1;
        match self.open.entry((downloader, piece)) {
            Entry::Occupied(_) => Err(Error::SessionConflict {
                downloader,
                piece: piece.get(),
            }),
            Entry::Vacant(vac) => {
                *self.fan_out.entry(source).or_default() += 1;
                trace!(piece = piece.get(), source = %source.short(), attempt, "session requested");
                Ok(vac.insert(TransferSession::new(
                    downloader, piece, source, now, deadline, attempt,
                )))
            }
        }
    }

    /// Requested -> InFlight. Returns false for a repeated acknowledgement.
    pub fn accept(
        &mut self,
        downloader: &PeerId,
        piece: ValidPieceIndex,
        deadline: Instant,
    ) -> crate::Result<bool> {
        let session = self
            .open
            .get_mut(&(*downloader, piece))
            .ok_or(Error::UnknownSession {
                downloader: *downloader,
                piece: piece.get(),
            })?;
        Ok(session.accept(deadline))
    }

    pub fn verify(
        &mut self,
        downloader: &PeerId,
        piece: ValidPieceIndex,
    ) -> crate::Result<FinishedTransfer> {
        self.finish(downloader, piece, TransferState::Verified)
    }

    pub fn fail(
        &mut self,
        downloader: &PeerId,
        piece: ValidPieceIndex,
        reason: FailureReason,
    ) -> crate::Result<FinishedTransfer> {
        self.finish(downloader, piece, TransferState::Failed(reason))
    }

    fn finish(
        &mut self,
        downloader: &PeerId,
        piece: ValidPieceIndex,
        state: TransferState,
    ) -> crate::Result<FinishedTransfer> {
        let key = (*downloader, piece);
        let mut session = self.open.remove(&key).ok_or(Error::UnknownSession {
            downloader: *downloader,
            piece: piece.get(),
        })?;
        session.state = state;
        self.release_fan_out(&session.source);

        let outcome = match state {
            TransferState::Verified => {
                self.verified_total += 1;
                self.history.remove(&key);
                TransferOutcome::Verified
            }
            TransferState::Failed(reason) => {
                self.failed_total += 1;
                let h = self.history.entry(key).or_default();
                h.attempts = session.attempt;
                h.failed_sources.insert(session.source);
                debug!(
                    piece = piece.get(),
                    source = %session.source.short(),
                    attempt = session.attempt,
                    ?reason,
                    "transfer failed"
                );
                if h.attempts >= self.max_attempts {
                    h.exhausted = true;
                    TransferOutcome::Unobtainable
                } else {
                    TransferOutcome::Retry
                }
            }
            TransferState::Requested | TransferState::InFlight => {
                unreachable!("finish() is only called with terminal states")
            }
        };
        Ok(FinishedTransfer { session, outcome })
    }

    fn release_fan_out(&mut self, source: &PeerId) {
        if let Some(c) = self.fan_out.get_mut(source) {
            *c = c.saturating_sub(1);
            if *c == 0 {
                self.fan_out.remove(source);
            }
        }
    }

    fn fail_matching(
        &mut self,
        reason: FailureReason,
        pred: impl Fn(&TransferSession) -> bool,
    ) -> Vec<FinishedTransfer> {
        let keys: Vec<SessionKey> = self
            .open
            .iter()
            .filter(|(_, s)| pred(s))
            .map(|(k, _)| *k)
            .collect();
        keys.into_iter()
            .filter_map(|(d, p)| self.fail(&d, p, reason).ok())
            .collect()
    }

    /// Fails every open session whose deadline is at or before `now`.
    pub fn expire(&mut self, now: Instant) -> Vec<FinishedTransfer> {
        self.fail_matching(FailureReason::DeadlineExpired, |s| s.is_expired(now))
    }

    pub fn cancel_sourced_by(&mut self, source: &PeerId) -> Vec<FinishedTransfer> {
        self.fail_matching(FailureReason::SourceDeparted, |s| s.source == *source)
    }

    /// Fails the sessions of a departing downloader and drops its history.
    pub fn cancel_downloaded_by(&mut self, downloader: &PeerId) -> Vec<FinishedTransfer> {
        let finished =
            self.fail_matching(FailureReason::DownloaderDeparted, |s| s.downloader == *downloader);
        self.history.retain(|(d, _), _| d != downloader);
        finished
    }

    pub fn iter_open(&self) -> impl Iterator<Item = &TransferSession> {
        self.open.values()
    }
}
