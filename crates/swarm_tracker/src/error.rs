use swarm_core::{Id20, PeerId};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("peer {0} is already active in this swarm")]
    DuplicatePeer(PeerId),

    #[error("peer {0} is not registered")]
    UnknownPeer(PeerId),

    #[error("torrent {0} is not registered")]
    UnknownTorrent(Id20),

    #[error("torrent {0} is already registered with different metadata")]
    DescriptorConflict(Id20),

    #[error("invalid piece index {0}")]
    InvalidPieceIndex(u32),

    #[error("piece {piece} already has an open transfer for downloader {downloader}")]
    SessionConflict { downloader: PeerId, piece: u32 },

    #[error("no open transfer of piece {piece} for downloader {downloader}")]
    UnknownSession { downloader: PeerId, piece: u32 },

    #[error(transparent)]
    InvalidDescriptor(#[from] swarm_core::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
