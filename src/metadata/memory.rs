use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{Metadata, MetadataError};

/// An in-memory store. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetadata {
    entries: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl Metadata for MemoryMetadata {
    async fn put(&self, key: &str, value: Option<Bytes>) -> Result<(), MetadataError> {
        let mut entries = self.entries.lock();
        match value {
            Some(value) => {
                entries.insert(key.to_string(), value);
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, MetadataError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn close(&self) -> Result<(), MetadataError> {
        Ok(())
    }
}
