//! Piece-granular byte storage.
//!
//! A [`Storage`] maps the pieces of a [`PiecesetDescriptor`] onto bytes
//! somewhere. Storage does not know which pieces are *correct*; it only
//! reports which are *backed* (every byte has somewhere to live) so that a
//! verification pass can skip reading pieces that cannot possibly be there.
//!
//! # Components
//!
//! - [`Storage`] - The storage contract
//! - [`FileStorage`] - Sparse multi-file storage on disk
//! - [`MemoryStorage`] - A single in-memory buffer
//! - [`OutputChannel`] - Sequential writer for bulk appends
//! - [`FileEntry`] - A backing file and its declared length
//!
//! # Examples
//!
//! ```no_run
//! use piecedb::storage::{FileEntry, FileStorage, Storage};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut storage = FileStorage::new(
//!     "./downloads",
//!     1024,
//!     vec![
//!         FileEntry::new("album/01.flac", 512),
//!         FileEntry::new("album/02.flac", 1024),
//!     ],
//! )?;
//!
//! // Piece 0 spans both files.
//! storage.write(0, &[7u8; 1024]).await?;
//! assert_eq!(storage.read(0).await?.len(), 1024);
//!
//! // The cookie lets a later session skip re-verification.
//! let cookie = storage.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! File paths are validated at construction. Paths containing `..` or
//! absolute paths are rejected with [`StorageError::IncompatibleLocation`].

mod channel;
mod cookie;
mod disk;
mod error;
mod file;
mod handles;
mod memory;

pub use channel::OutputChannel;
pub use disk::FileStorage;
pub use error::StorageError;
pub use file::FileEntry;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use bytes::Bytes;

use crate::bitfield::Bitfield;
use crate::pieceset::PiecesetDescriptor;

/// Byte storage for one piece layout.
///
/// A storage is owned by exactly one database at a time.
#[async_trait]
pub trait Storage: Send + Sync {
    /// The current layout.
    fn descriptor(&self) -> PiecesetDescriptor;

    /// Pieces whose whole byte range is backed by existing data.
    async fn storage_backed_pieces(&self) -> Result<Bitfield, StorageError>;

    /// Checks a cookie issued by [`close`](Storage::close) against the
    /// current state of the backing data. A missing cookie never validates.
    async fn validate(&self, cookie: Option<&[u8]>) -> Result<bool, StorageError>;

    /// Grows the total length to `new_length`.
    async fn extend(&mut self, new_length: u64) -> Result<(), StorageError>;

    /// Releases resources, returning a cookie if this storage persists.
    async fn close(&mut self) -> Result<Option<Bytes>, StorageError>;

    /// Reads `length` bytes at linear `offset`. Missing data reads as zeros.
    async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes, StorageError>;

    /// Writes `data` at linear `offset`, returning how many bytes landed.
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize, StorageError>;

    /// Opens a sequential writer at byte `offset` of `piece`.
    fn open_output_channel(
        &mut self,
        piece: u32,
        offset: u32,
    ) -> Result<OutputChannel<'_>, StorageError>;

    /// Reads a whole piece.
    async fn read(&self, piece: u32) -> Result<Bytes, StorageError> {
        let range = self.descriptor().piece_range(piece)?;
        self.read_at(range.start, (range.end - range.start) as usize)
            .await
    }

    /// Writes a whole piece; `data` must be exactly the piece's length.
    async fn write(&mut self, piece: u32, data: &[u8]) -> Result<(), StorageError> {
        let expected = self.descriptor().piece_length(piece)?;
        if data.len() != expected as usize {
            return Err(StorageError::LengthMismatch {
                piece,
                expected,
                actual: data.len(),
            });
        }
        let offset = self.descriptor().piece_offset(piece);
        self.write_at(offset, data).await?;
        Ok(())
    }
}
