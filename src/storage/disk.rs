use std::io::{ErrorKind, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::channel::OutputChannel;
use super::cookie::{self, FileStamp};
use super::error::StorageError;
use super::file::{FileEntry, FileLayout};
use super::handles::FileHandleCache;
use super::Storage;
use crate::bitfield::Bitfield;
use crate::constants::FILE_HANDLE_IDLE_TIMEOUT;
use crate::pieceset::PiecesetDescriptor;

/// Sparse storage over a list of files under a base directory.
///
/// Declared file lengths define the layout; the files themselves may be
/// shorter or missing. Reads zero-fill whatever the disk doesn't have and
/// never touch the filesystem beyond opening existing files. Writes create
/// files and parent directories as needed, but never grow a file past its
/// declared length.
pub struct FileStorage {
    layout: FileLayout,
    descriptor: PiecesetDescriptor,
    handles: FileHandleCache,
    closed: bool,
}

impl FileStorage {
    /// Creates a storage for `files`, laid out in order under `base_path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::IncompatibleLocation`] if `base_path` is an
    /// existing regular file, if a file path is absolute or escapes the base
    /// directory, or if a file path names an existing directory.
    pub fn new(
        base_path: impl Into<PathBuf>,
        piece_size: u32,
        files: Vec<FileEntry>,
    ) -> Result<Self, StorageError> {
        let base_path = base_path.into();
        if base_path.is_file() {
            return Err(StorageError::IncompatibleLocation(
                base_path.display().to_string(),
            ));
        }

        let layout = FileLayout::new(files)?;
        let descriptor = PiecesetDescriptor::new(piece_size, layout.total_length())?;
        let paths: Vec<PathBuf> = layout
            .files()
            .iter()
            .map(|f| base_path.join(&f.path))
            .collect();
        if let Some(dir) = paths.iter().find(|p| p.is_dir()) {
            return Err(StorageError::IncompatibleLocation(dir.display().to_string()));
        }

        Ok(Self {
            layout,
            descriptor,
            handles: FileHandleCache::new(paths, FILE_HANDLE_IDLE_TIMEOUT),
            closed: false,
        })
    }

    pub fn with_handle_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.handles.set_idle_timeout(idle_timeout);
        self
    }

    /// The files in layout order, with their current declared lengths.
    pub fn files(&self) -> &[FileEntry] {
        self.layout.files()
    }

    /// Number of file handles currently held open.
    pub fn open_handle_count(&self) -> usize {
        self.handles.open_count()
    }

    /// Closes handles that have sat unused longer than the idle timeout.
    pub async fn evict_idle_handles(&self) {
        self.handles.evict_idle().await;
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    async fn file_lengths(&self) -> Result<Vec<Option<u64>>, StorageError> {
        let mut lengths = Vec::with_capacity(self.layout.files().len());
        for index in 0..self.layout.files().len() {
            match tokio::fs::metadata(self.handles.path(index)).await {
                Ok(metadata) => lengths.push(Some(metadata.len())),
                Err(e) if e.kind() == ErrorKind::NotFound => lengths.push(None),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(lengths)
    }

    async fn cookie(&self) -> Result<Bytes, StorageError> {
        let mut stamps = Vec::with_capacity(self.layout.files().len());
        for index in 0..self.layout.files().len() {
            stamps.push(FileStamp::of(self.handles.path(index)).await?);
        }
        Ok(cookie::encode(&stamps))
    }
}

#[async_trait]
impl Storage for FileStorage {
    fn descriptor(&self) -> PiecesetDescriptor {
        self.descriptor
    }

    async fn storage_backed_pieces(&self) -> Result<Bitfield, StorageError> {
        self.check_open()?;
        let lengths = self.file_lengths().await?;
        let count = self.descriptor.number_of_pieces();
        let mut backed = Bitfield::new(count as usize);

        for piece in 0..count {
            let range = self.descriptor.piece_range(piece)?;
            let complete = self
                .layout
                .spans(range.start, range.end - range.start)
                .iter()
                .filter(|span| span.length > 0)
                .all(|span| {
                    lengths[span.file_index]
                        .is_some_and(|len| len >= span.file_offset + span.length)
                });
            if complete {
                backed.set(piece as usize);
            }
        }
        Ok(backed)
    }

    async fn validate(&self, cookie: Option<&[u8]>) -> Result<bool, StorageError> {
        let Some(cookie) = cookie else {
            return Ok(false);
        };
        Ok(self.cookie().await?.as_ref() == cookie)
    }

    async fn extend(&mut self, new_length: u64) -> Result<(), StorageError> {
        self.check_open()?;
        let descriptor = self.descriptor.with_total_length(new_length)?;
        self.layout.extend(new_length)?;
        self.descriptor = descriptor;
        tracing::debug!(new_length, "extended file storage");
        Ok(())
    }

    async fn close(&mut self) -> Result<Option<Bytes>, StorageError> {
        self.check_open()?;
        self.closed = true;
        self.handles.flush_all().await?;
        Ok(Some(self.cookie().await?))
    }

    async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes, StorageError> {
        self.check_open()?;
        let mut buf = vec![0u8; length];
        let mut cursor = 0usize;

        for span in self.layout.spans(offset, length as u64) {
            if span.length == 0 {
                continue;
            }
            let len = span.length as usize;
            if let Some(handle) = self.handles.get_or_open_read(span.file_index).await? {
                let mut file = handle.file.lock().await;
                let actual = file.metadata().await?.len();
                let available = actual.saturating_sub(span.file_offset).min(span.length) as usize;
                if available > 0 {
                    file.seek(SeekFrom::Start(span.file_offset)).await?;
                    file.read_exact(&mut buf[cursor..cursor + available]).await?;
                }
            }
            cursor += len;
        }

        Ok(Bytes::from(buf))
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize, StorageError> {
        self.check_open()?;
        let mut cursor = 0usize;

        for span in self.layout.spans(offset, data.len() as u64) {
            let handle = self.handles.get_or_open_write(span.file_index).await?;
            if span.length == 0 {
                continue;
            }
            let len = span.length as usize;
            let mut file = handle.file.lock().await;
            file.seek(SeekFrom::Start(span.file_offset)).await?;
            file.write_all(&data[cursor..cursor + len]).await?;
            file.flush().await?;
            cursor += len;
        }

        if cursor < data.len() {
            tracing::trace!(
                discarded = data.len() - cursor,
                "dropped bytes past the last declared file"
            );
        }
        Ok(cursor)
    }

    fn open_output_channel(
        &mut self,
        piece: u32,
        offset: u32,
    ) -> Result<OutputChannel<'_>, StorageError> {
        OutputChannel::new(self, piece, offset)
    }
}
