//! Pieces and the blocks they are assembled from.
//!
//! A piece moves in and out of the database as a [`Piece`]. Pieces read from
//! storage are *complete*; pieces being downloaded start *assembling*, split
//! into [`BlockDescriptor`]s that are filled one by one with
//! [`Piece::put_block`].
//!
//! # Examples
//!
//! ```
//! use piecedb::piece::Piece;
//!
//! let mut piece = Piece::assembling(0, 40_000, 16384);
//! let blocks: Vec<_> = piece.needed_blocks().cloned().collect();
//! assert_eq!(blocks.len(), 3);
//!
//! for block in blocks.iter().rev() {
//!     let data = vec![7u8; block.length as usize];
//!     let done = piece.put_block(block, &data).unwrap();
//!     assert_eq!(done, block.offset == 0);
//! }
//! assert!(piece.is_complete());
//! ```

mod assembly;
mod block;

pub use assembly::Piece;
pub use block::{compute_block_count, compute_block_length, BlockDescriptor, BlockError};
