use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use super::error::StorageError;

/// A backing file and the length the layout declares for it.
///
/// The file on disk may be shorter than `length`, or missing altogether.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
}

impl FileEntry {
    pub fn new(path: impl Into<PathBuf>, length: u64) -> Self {
        Self {
            path: path.into(),
            length,
        }
    }
}

/// The part of a linear byte range that falls inside one file.
///
/// Zero-length spans name the zero-length files walked through on the way
/// to the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileSpan {
    pub(crate) file_index: usize,
    pub(crate) file_offset: u64,
    pub(crate) length: u64,
}

/// Maps linear offsets onto the declared files.
#[derive(Debug, Clone)]
pub(crate) struct FileLayout {
    files: Vec<FileEntry>,
    /// First file starting at each cumulative declared offset.
    starts: BTreeMap<u64, usize>,
    total_length: u64,
}

impl FileLayout {
    pub(crate) fn new(files: Vec<FileEntry>) -> Result<Self, StorageError> {
        for file in &files {
            validate_file_path(&file.path)?;
        }
        let mut layout = Self {
            files,
            starts: BTreeMap::new(),
            total_length: 0,
        };
        layout.rebuild();
        Ok(layout)
    }

    fn rebuild(&mut self) {
        self.starts.clear();
        let mut offset = 0u64;
        for (index, file) in self.files.iter().enumerate() {
            self.starts.entry(offset).or_insert(index);
            offset += file.length;
        }
        self.total_length = offset;
    }

    pub(crate) fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub(crate) fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Grows the last file so the layout covers `new_length` bytes.
    pub(crate) fn extend(&mut self, new_length: u64) -> Result<(), StorageError> {
        if new_length < self.total_length {
            return Err(StorageError::Shrink {
                current: self.total_length,
                requested: new_length,
            });
        }
        let grow = new_length - self.total_length;
        let last = self.files.last_mut().ok_or(StorageError::NoFiles)?;
        last.length += grow;
        self.rebuild();
        Ok(())
    }

    /// Splits `[offset, offset + length)` into per-file spans.
    ///
    /// The walk starts at the first file beginning at or before `offset`, so
    /// any zero-length files sitting at the start of the range show up as
    /// empty spans. Bytes past the last file produce no span.
    pub(crate) fn spans(&self, offset: u64, length: u64) -> Vec<FileSpan> {
        let mut spans = Vec::new();
        let Some((&start, &first)) = self.starts.range(..=offset).next_back() else {
            return spans;
        };

        let mut index = first;
        let mut position = offset - start;
        let mut remaining = length;
        while remaining > 0 && index < self.files.len() {
            let file_length = self.files[index].length;
            if position >= file_length {
                if file_length == 0 {
                    spans.push(FileSpan {
                        file_index: index,
                        file_offset: 0,
                        length: 0,
                    });
                }
                position -= file_length;
                index += 1;
                continue;
            }

            let take = (file_length - position).min(remaining);
            spans.push(FileSpan {
                file_index: index,
                file_offset: position,
                length: take,
            });
            remaining -= take;
            position = 0;
            index += 1;
        }
        spans
    }
}

fn validate_file_path(file_path: &Path) -> Result<(), StorageError> {
    if file_path.as_os_str().is_empty() {
        return Err(StorageError::IncompatibleLocation(
            "empty file path".to_string(),
        ));
    }
    for component in file_path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::IncompatibleLocation(
                    file_path.display().to_string(),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}
