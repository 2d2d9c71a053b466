//! Piece layout description.
//!
//! A [`PiecesetDescriptor`] is the pure value behind every piece-indexed
//! operation: given a piece size and a total length it answers how many
//! pieces there are, where each one starts and how long it is.

use std::ops::Range;

use crate::storage::StorageError;

/// Piece size and total length of a chunked data layout.
///
/// Every piece is `piece_size` bytes except the last, which holds whatever
/// remains. A zero-length layout has no pieces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PiecesetDescriptor {
    piece_size: u32,
    total_length: u64,
    number_of_pieces: u32,
}

impl PiecesetDescriptor {
    /// Creates a descriptor, rejecting a zero piece size.
    pub fn new(piece_size: u32, total_length: u64) -> Result<Self, StorageError> {
        if piece_size == 0 {
            return Err(StorageError::InvalidPieceSize);
        }
        let number_of_pieces = total_length.div_ceil(piece_size as u64);
        let number_of_pieces =
            u32::try_from(number_of_pieces).map_err(|_| StorageError::TooManyPieces(total_length))?;
        Ok(Self {
            piece_size,
            total_length,
            number_of_pieces,
        })
    }

    /// Returns the same layout grown (or shrunk) to `total_length`.
    pub fn with_total_length(&self, total_length: u64) -> Result<Self, StorageError> {
        Self::new(self.piece_size, total_length)
    }

    pub fn piece_size(&self) -> u32 {
        self.piece_size
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn number_of_pieces(&self) -> u32 {
        self.number_of_pieces
    }

    /// Length of piece `index`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidPieceIndex`] if `index` is not in
    /// `[0, number_of_pieces)`.
    pub fn piece_length(&self, index: u32) -> Result<u32, StorageError> {
        if index >= self.number_of_pieces {
            return Err(StorageError::InvalidPieceIndex(index));
        }
        if index + 1 < self.number_of_pieces {
            return Ok(self.piece_size);
        }
        let rem = (self.total_length % self.piece_size as u64) as u32;
        Ok(if rem == 0 { self.piece_size } else { rem })
    }

    /// Linear byte offset of the first byte of piece `index`.
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_size as u64
    }

    /// Linear byte range covered by piece `index`.
    pub fn piece_range(&self, index: u32) -> Result<Range<u64>, StorageError> {
        let start = self.piece_offset(index);
        Ok(start..start + self.piece_length(index)? as u64)
    }

    /// Index of the piece holding linear byte `offset`, if any.
    pub fn piece_at(&self, offset: u64) -> Option<u32> {
        if offset >= self.total_length {
            return None;
        }
        Some((offset / self.piece_size as u64) as u32)
    }
}
