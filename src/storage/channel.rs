use super::error::StorageError;
use super::Storage;

/// A sequential writer starting at some offset inside a piece.
///
/// Each write continues where the previous one stopped, freely crossing
/// piece and file boundaries.
pub struct OutputChannel<'a> {
    storage: &'a mut dyn Storage,
    position: u64,
}

impl<'a> OutputChannel<'a> {
    /// Opens a channel at byte `offset` of piece `piece`.
    pub fn new(storage: &'a mut dyn Storage, piece: u32, offset: u32) -> Result<Self, StorageError> {
        let descriptor = storage.descriptor();
        if offset >= descriptor.piece_length(piece)? {
            return Err(StorageError::InvalidOffset { piece, offset });
        }
        Ok(Self {
            position: descriptor.piece_offset(piece) + offset as u64,
            storage,
        })
    }

    /// Writes `data` at the current position and advances past it.
    ///
    /// Returns how many bytes the storage accepted; anything past the end
    /// of the storage is dropped.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, StorageError> {
        let accepted = self.storage.write_at(self.position, data).await?;
        self.position += data.len() as u64;
        Ok(accepted)
    }

    /// Linear offset the next write lands at.
    pub fn position(&self) -> u64 {
        self.position
    }
}
