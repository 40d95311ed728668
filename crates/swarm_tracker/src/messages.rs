use serde::{Deserialize, Serialize};
use swarm_core::{Id20, PeerId};

use crate::{
    scheduler::ScheduledPiece,
    transfer::{TransferOutcome, TransferState},
    type_aliases::PeerAddr,
};

/// An already-parsed message from the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    PeerJoin {
        content_id: Id20,
        peer_id: PeerId,
        addr: PeerAddr,
        #[serde(default)]
        pieces: Vec<u32>,
    },
    Heartbeat {
        content_id: Id20,
        peer_id: PeerId,
        #[serde(default)]
        delta: Vec<u32>,
    },
    PeerLeave {
        content_id: Id20,
        peer_id: PeerId,
    },
    RequestPieces {
        content_id: Id20,
        peer_id: PeerId,
        count: usize,
    },
    /// The source accepted or rejected a scheduled request.
    PieceRequestResult {
        content_id: Id20,
        downloader: PeerId,
        piece: u32,
        accepted: bool,
    },
    ReportPieceResult {
        content_id: Id20,
        downloader: PeerId,
        piece: u32,
        success: bool,
        byte_count: u64,
        hash: Option<Id20>,
    },
}

impl InboundEvent {
    pub fn content_id(&self) -> Id20 {
        match self {
            InboundEvent::PeerJoin { content_id, .. }
            | InboundEvent::Heartbeat { content_id, .. }
            | InboundEvent::PeerLeave { content_id, .. }
            | InboundEvent::RequestPieces { content_id, .. }
            | InboundEvent::PieceRequestResult { content_id, .. }
            | InboundEvent::ReportPieceResult { content_id, .. } => *content_id,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        match self {
            InboundEvent::PeerJoin { peer_id, .. }
            | InboundEvent::Heartbeat { peer_id, .. }
            | InboundEvent::PeerLeave { peer_id, .. }
            | InboundEvent::RequestPieces { peer_id, .. } => *peer_id,
            InboundEvent::PieceRequestResult { downloader, .. }
            | InboundEvent::ReportPieceResult { downloader, .. } => *downloader,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::PeerJoin { .. } => "peer_join",
            InboundEvent::Heartbeat { .. } => "heartbeat",
            InboundEvent::PeerLeave { .. } => "peer_leave",
            InboundEvent::RequestPieces { .. } => "request_pieces",
            InboundEvent::PieceRequestResult { .. } => "piece_request_result",
            InboundEvent::ReportPieceResult { .. } => "report_piece_result",
        }
    }
}

/// How a reported piece result ended its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub piece: u32,
    pub source: PeerId,
    pub attempt: u32,
    pub state: TransferState,
    pub outcome: TransferOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ack,
    Scheduled { pieces: Vec<ScheduledPiece> },
    Transfer(TransferReport),
}
