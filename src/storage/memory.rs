use async_trait::async_trait;
use bytes::Bytes;

use super::channel::OutputChannel;
use super::error::StorageError;
use super::Storage;
use crate::bitfield::Bitfield;
use crate::constants::MAX_MEMORY_STORAGE_LENGTH;
use crate::pieceset::PiecesetDescriptor;

/// Storage held in one contiguous buffer.
///
/// Every piece is always backed, and nothing survives the process, so a
/// cookie never validates.
pub struct MemoryStorage {
    data: Vec<u8>,
    descriptor: PiecesetDescriptor,
}

impl MemoryStorage {
    /// A zero-filled buffer of `total_length` bytes.
    pub fn new(piece_size: u32, total_length: u64) -> Result<Self, StorageError> {
        let len = buffer_len(total_length)?;
        let descriptor = PiecesetDescriptor::new(piece_size, total_length)?;
        Ok(Self {
            data: vec![0; len],
            descriptor,
        })
    }

    /// Wraps existing content.
    pub fn with_data(piece_size: u32, data: impl Into<Vec<u8>>) -> Result<Self, StorageError> {
        let data = data.into();
        let descriptor = PiecesetDescriptor::new(piece_size, data.len() as u64)?;
        Ok(Self { data, descriptor })
    }

    /// The whole buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

fn buffer_len(total_length: u64) -> Result<usize, StorageError> {
    if total_length > MAX_MEMORY_STORAGE_LENGTH {
        return Err(StorageError::TooLarge(total_length));
    }
    usize::try_from(total_length).map_err(|_| StorageError::TooLarge(total_length))
}

#[async_trait]
impl Storage for MemoryStorage {
    fn descriptor(&self) -> PiecesetDescriptor {
        self.descriptor
    }

    async fn storage_backed_pieces(&self) -> Result<Bitfield, StorageError> {
        Ok(Bitfield::full(self.descriptor.number_of_pieces() as usize))
    }

    async fn validate(&self, _cookie: Option<&[u8]>) -> Result<bool, StorageError> {
        Ok(false)
    }

    async fn extend(&mut self, new_length: u64) -> Result<(), StorageError> {
        let current = self.descriptor.total_length();
        if new_length < current {
            return Err(StorageError::Shrink {
                current,
                requested: new_length,
            });
        }
        let len = buffer_len(new_length)?;
        self.descriptor = self.descriptor.with_total_length(new_length)?;
        self.data.resize(len, 0);
        Ok(())
    }

    async fn close(&mut self) -> Result<Option<Bytes>, StorageError> {
        Ok(None)
    }

    async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes, StorageError> {
        let mut buf = vec![0u8; length];
        let start = (offset.min(self.data.len() as u64)) as usize;
        let end = start.saturating_add(length).min(self.data.len());
        buf[..end - start].copy_from_slice(&self.data[start..end]);
        Ok(Bytes::from(buf))
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize, StorageError> {
        let start = (offset.min(self.data.len() as u64)) as usize;
        let end = start.saturating_add(data.len()).min(self.data.len());
        let accepted = end - start;
        self.data[start..end].copy_from_slice(&data[..accepted]);
        Ok(accepted)
    }

    fn open_output_channel(
        &mut self,
        piece: u32,
        offset: u32,
    ) -> Result<OutputChannel<'_>, StorageError> {
        OutputChannel::new(self, piece, offset)
    }
}
