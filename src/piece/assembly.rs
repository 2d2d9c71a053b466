use std::collections::BTreeSet;

use bytes::{Bytes, BytesMut};

use super::block::{compute_block_count, compute_block_length, BlockDescriptor, BlockError};
use crate::constants::DEFAULT_BLOCK_SIZE;
use crate::merkle::HashChain;
use crate::metainfo::ViewSignature;

/// A piece of data, either complete or being assembled from blocks.
#[derive(Debug, Clone)]
pub struct Piece {
    number: u32,
    content: BytesMut,
    needed: BTreeSet<BlockDescriptor>,
    hash_chain: Option<HashChain>,
    view_signature: Option<ViewSignature>,
}

impl Piece {
    /// Wraps bytes that are already whole, for example a piece read back
    /// from storage.
    pub fn complete(number: u32, content: impl Into<Bytes>) -> Self {
        let content: Bytes = content.into();
        Self {
            number,
            content: BytesMut::from(content.as_ref()),
            needed: BTreeSet::new(),
            hash_chain: None,
            view_signature: None,
        }
    }

    /// Creates an empty piece of `length` bytes that needs every block of at
    /// most `max_block_size` bytes before it is complete.
    pub fn assembling(number: u32, length: u32, max_block_size: u32) -> Self {
        let block_size = max_block_size.max(1);
        let needed = (0..compute_block_count(length as u64, block_size))
            .map(|i| {
                BlockDescriptor::new(
                    number,
                    i * block_size,
                    compute_block_length(length as u64, i, block_size),
                )
            })
            .collect();
        Self {
            number,
            content: BytesMut::zeroed(length as usize),
            needed,
            hash_chain: None,
            view_signature: None,
        }
    }

    /// [`assembling`](Self::assembling) with the default block size.
    pub fn with_length(number: u32, length: u32) -> Self {
        Self::assembling(number, length, DEFAULT_BLOCK_SIZE)
    }

    /// Attaches a proof of this piece against a hash-tree view.
    pub fn with_hash_chain(mut self, chain: HashChain) -> Self {
        self.hash_chain = Some(chain);
        self
    }

    /// Attaches the signature of the view the hash chain refers to.
    pub fn with_view_signature(mut self, signature: ViewSignature) -> Self {
        self.view_signature = Some(signature);
        self
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Blocks still missing, in ascending offset order.
    pub fn needed_blocks(&self) -> impl Iterator<Item = &BlockDescriptor> {
        self.needed.iter()
    }

    pub fn is_needed(&self, block: &BlockDescriptor) -> bool {
        self.needed.contains(block)
    }

    pub fn is_complete(&self) -> bool {
        self.needed.is_empty()
    }

    /// Fills in one needed block.
    ///
    /// Returns `true` iff this call supplied the last outstanding block.
    ///
    /// # Errors
    ///
    /// Fails without touching the piece if `block` is not currently needed
    /// or `data` is not exactly `block.length` bytes.
    pub fn put_block(&mut self, block: &BlockDescriptor, data: &[u8]) -> Result<bool, BlockError> {
        if !self.needed.contains(block) {
            return Err(BlockError::NotNeeded(*block));
        }
        if data.len() != block.length as usize {
            return Err(BlockError::LengthMismatch {
                block: *block,
                actual: data.len(),
            });
        }

        self.needed.remove(block);
        let start = block.offset as usize;
        self.content[start..start + data.len()].copy_from_slice(data);
        Ok(self.needed.is_empty())
    }

    /// Borrows the bytes of `block`.
    pub fn block(&self, block: &BlockDescriptor) -> Result<&[u8], BlockError> {
        if block.piece_index != self.number {
            return Err(BlockError::WrongPiece {
                block: *block,
                piece: self.number,
            });
        }
        let start = block.offset as usize;
        let end = start + block.length as usize;
        if end > self.content.len() {
            return Err(BlockError::OutOfRange {
                block: *block,
                piece_length: self.content.len(),
            });
        }
        Ok(&self.content[start..end])
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn into_content(self) -> Bytes {
        self.content.freeze()
    }

    pub fn hash_chain(&self) -> Option<&HashChain> {
        self.hash_chain.as_ref()
    }

    pub fn view_signature(&self) -> Option<&ViewSignature> {
        self.view_signature.as_ref()
    }
}
