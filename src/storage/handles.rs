use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::fs::{File, OpenOptions};
use tokio::sync::Mutex as TokioMutex;

use super::error::StorageError;

pub(crate) struct PerFileHandle {
    pub(crate) file: TokioMutex<File>,
    last_used: parking_lot::Mutex<Instant>,
    is_write: bool,
}

impl PerFileHandle {
    fn new(file: File, is_write: bool) -> Arc<Self> {
        Arc::new(Self {
            file: TokioMutex::new(file),
            last_used: parking_lot::Mutex::new(Instant::now()),
            is_write,
        })
    }

    fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }
}

/// Lazily opened handles, one per backing file.
///
/// Nothing is opened until a file is first touched. Read handles are never
/// created for missing files; write handles create the file and its parent
/// directories on demand.
pub(crate) struct FileHandleCache {
    handles: DashMap<usize, Arc<PerFileHandle>>,
    paths: Vec<PathBuf>,
    idle_timeout: Duration,
}

impl FileHandleCache {
    pub(crate) fn new(paths: Vec<PathBuf>, idle_timeout: Duration) -> Self {
        Self {
            handles: DashMap::new(),
            paths,
            idle_timeout,
        }
    }

    pub(crate) fn set_idle_timeout(&mut self, idle_timeout: Duration) {
        self.idle_timeout = idle_timeout;
    }

    pub(crate) fn path(&self, file_index: usize) -> &PathBuf {
        &self.paths[file_index]
    }

    pub(crate) fn open_count(&self) -> usize {
        self.handles.len()
    }

    /// Returns a handle for reading, or `None` if the file does not exist.
    pub(crate) async fn get_or_open_read(
        &self,
        file_index: usize,
    ) -> Result<Option<Arc<PerFileHandle>>, StorageError> {
        if let Some(handle) = self.handles.get(&file_index) {
            handle.touch();
            return Ok(Some(handle.clone()));
        }

        let file = match File::open(self.path(file_index)).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let handle = PerFileHandle::new(file, false);
        self.handles.insert(file_index, handle.clone());
        Ok(Some(handle))
    }

    pub(crate) async fn get_or_open_write(
        &self,
        file_index: usize,
    ) -> Result<Arc<PerFileHandle>, StorageError> {
        if let Some(handle) = self.handles.get(&file_index) {
            if handle.is_write {
                handle.touch();
                return Ok(handle.clone());
            }
            drop(handle);
            self.handles.remove(&file_index);
        }

        let path = self.path(file_index);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .await?;
        tracing::trace!(path = %path.display(), "opened backing file for writing");

        let handle = PerFileHandle::new(file, true);
        self.handles.insert(file_index, handle.clone());
        Ok(handle)
    }

    /// Syncs and drops every handle.
    pub(crate) async fn flush_all(&self) -> Result<(), StorageError> {
        let keys: Vec<usize> = self.handles.iter().map(|r| *r.key()).collect();
        let mut first_error = None;
        for key in keys {
            if let Some((_, handle)) = self.handles.remove(&key) {
                if handle.is_write {
                    let file = handle.file.lock().await;
                    if let Err(e) = file.sync_data().await {
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub(crate) async fn evict_idle(&self) {
        let now = Instant::now();
        let to_evict: Vec<usize> = self
            .handles
            .iter()
            .filter(|r| now.duration_since(*r.last_used.lock()) > self.idle_timeout)
            .map(|r| *r.key())
            .collect();

        for idx in to_evict {
            if let Some((_, handle)) = self.handles.remove(&idx) {
                if handle.is_write {
                    let file = handle.file.lock().await;
                    if let Err(e) = file.sync_data().await {
                        tracing::warn!(error = %e, "failed to sync evicted file handle");
                    }
                }
            }
        }
    }
}
