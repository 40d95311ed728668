#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("torrent with 0 length is useless")]
    ZeroLength,
    #[error("invalid piece length {0}")]
    InvalidPieceLength(u32),
    #[error("expected {expected} piece hashes, got {actual}")]
    PieceCountMismatch { expected: usize, actual: usize },
    #[error("bad piece geometry: {0:#}")]
    Lengths(#[source] anyhow::Error),
}

pub type Result<T> = core::result::Result<T, Error>;
