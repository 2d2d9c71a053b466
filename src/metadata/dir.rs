use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use super::{Metadata, MetadataError};

/// One file per key inside a directory.
///
/// Writes go to a temporary file which is synced and then renamed over the
/// key, so a crash leaves either the old value or the new one.
#[derive(Debug, Clone)]
pub struct DirMetadata {
    dir: PathBuf,
}

impl DirMetadata {
    /// Opens the store, creating `dir` if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, MetadataError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, MetadataError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(MetadataError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl Metadata for DirMetadata {
    async fn put(&self, key: &str, value: Option<Bytes>) -> Result<(), MetadataError> {
        let path = self.key_path(key)?;
        let Some(value) = value else {
            return match tokio::fs::remove_file(&path).await {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        };

        let tmp = self.dir.join(format!(".{key}.tmp"));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&value).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, MetadataError> {
        match tokio::fs::read(self.key_path(key)?).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn close(&self) -> Result<(), MetadataError> {
        let dir = tokio::fs::File::open(&self.dir).await?;
        dir.sync_all().await?;
        Ok(())
    }
}
