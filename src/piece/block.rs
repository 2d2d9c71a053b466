use thiserror::Error;

/// Address of a block: a byte range inside one piece.
///
/// Ordering is by piece, then offset, then length, so a sorted set of the
/// blocks of one piece iterates in ascending offset order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockDescriptor {
    pub piece_index: u32,
    pub offset: u32,
    pub length: u32,
}

impl BlockDescriptor {
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }

    /// One past the last byte of the block, relative to the piece start.
    pub fn end(&self) -> u32 {
        self.offset + self.length
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("block {0:?} is not needed by this piece")]
    NotNeeded(BlockDescriptor),

    #[error("block {block:?} expects {} bytes, got {actual}", block.length)]
    LengthMismatch { block: BlockDescriptor, actual: usize },

    #[error("block {block:?} does not belong to piece {piece}")]
    WrongPiece { block: BlockDescriptor, piece: u32 },

    #[error("block {block:?} lies outside a piece of {piece_length} bytes")]
    OutOfRange {
        block: BlockDescriptor,
        piece_length: usize,
    },
}

/// Number of blocks of at most `block_size` bytes needed for a piece.
pub fn compute_block_count(piece_length: u64, block_size: u32) -> u32 {
    piece_length.div_ceil(block_size as u64) as u32
}

/// Length of block `block_index` of a piece.
pub fn compute_block_length(piece_length: u64, block_index: u32, block_size: u32) -> u32 {
    let offset = block_index as u64 * block_size as u64;
    let remaining = piece_length.saturating_sub(offset);
    remaining.min(block_size as u64) as u32
}
