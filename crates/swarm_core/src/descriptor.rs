use std::sync::Arc;

use crate::{
    error::Error,
    hash_id::Id20,
    lengths::{Lengths, ValidPieceIndex},
};

/// Parsed and validated torrent metadata. Immutable once built, shared by
/// every peer of the torrent through an [`Arc`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentDescriptor {
    content_id: Id20,
    lengths: Lengths,
    piece_hashes: Vec<Id20>,
}

impl TorrentDescriptor {
    pub fn new(
        content_id: Id20,
        total_size: u64,
        piece_size: u32,
        piece_hashes: Vec<Id20>,
    ) -> crate::Result<Arc<Self>> {
        if total_size == 0 {
            return Err(Error::ZeroLength);
        }
        if piece_size == 0 {
            return Err(Error::InvalidPieceLength(piece_size));
        }
        let lengths = Lengths::new(total_size, piece_size).map_err(Error::Lengths)?;
        if piece_hashes.len() != lengths.total_pieces() as usize {
            return Err(Error::PieceCountMismatch {
                expected: lengths.total_pieces() as usize,
                actual: piece_hashes.len(),
            });
        }
        Ok(Arc::new(Self {
            content_id,
            lengths,
            piece_hashes,
        }))
    }

    pub fn content_id(&self) -> Id20 {
        self.content_id
    }

    pub fn lengths(&self) -> &Lengths {
        &self.lengths
    }

    pub fn piece_count(&self) -> u32 {
        self.lengths.total_pieces()
    }

    pub fn piece_size(&self) -> u32 {
        self.lengths.default_piece_length()
    }

    pub fn total_size(&self) -> u64 {
        self.lengths.total_length()
    }

    pub fn validate_piece_index(&self, index: u32) -> Option<ValidPieceIndex> {
        self.lengths.validate_piece_index(index)
    }

    pub fn piece_hash(&self, index: ValidPieceIndex) -> Id20 {
        self.piece_hashes[index.get() as usize]
    }

    pub fn piece_length(&self, index: ValidPieceIndex) -> u32 {
        self.lengths.piece_length(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashes(n: usize) -> Vec<Id20> {
        (0..n).map(|i| Id20::new([i as u8; 20])).collect()
    }

    #[test]
    fn test_descriptor_valid() {
        let d = TorrentDescriptor::new(Id20::new([9; 20]), 2500, 1000, hashes(3)).unwrap();
        assert_eq!(d.piece_count(), 3);
        let last = d.validate_piece_index(2).unwrap();
        assert_eq!(d.piece_length(last), 500);
        assert_eq!(d.piece_hash(last), Id20::new([2; 20]));
        assert!(d.validate_piece_index(3).is_none());
    }

    #[test]
    fn test_descriptor_piece_count_mismatch() {
        let err = TorrentDescriptor::new(Id20::default(), 2500, 1000, hashes(2)).unwrap_err();
        assert!(matches!(
            err,
            Error::PieceCountMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn test_descriptor_zero_length() {
        assert!(matches!(
            TorrentDescriptor::new(Id20::default(), 0, 1000, vec![]),
            Err(Error::ZeroLength)
        ));
    }
}
