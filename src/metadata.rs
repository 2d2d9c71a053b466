//! Persistent key/value storage for resume state.
//!
//! A database with a [`Metadata`] store remembers which pieces it verified,
//! plus its hash-tree state, across sessions. Values are opaque bytes.
//!
//! # Examples
//!
//! ```
//! use bytes::Bytes;
//! use piecedb::metadata::{Metadata, MemoryMetadata};
//!
//! # async fn example() -> Result<(), piecedb::metadata::MetadataError> {
//! let store = MemoryMetadata::new();
//! store.put("resume", Some(Bytes::from_static(b"state"))).await?;
//! assert_eq!(store.get("resume").await?.as_deref(), Some(&b"state"[..]));
//!
//! store.put("resume", None).await?;
//! assert!(store.get("resume").await?.is_none());
//! # Ok(())
//! # }
//! ```

mod dir;
mod memory;

pub use dir::DirMetadata;
pub use memory::MemoryMetadata;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid metadata key: {0:?}")]
    InvalidKey(String),
}

/// A key/value store.
#[async_trait]
pub trait Metadata: Send + Sync {
    /// Stores `value` under `key`; `None` removes the key.
    async fn put(&self, key: &str, value: Option<Bytes>) -> Result<(), MetadataError>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, MetadataError>;

    /// Flushes anything outstanding.
    async fn close(&self) -> Result<(), MetadataError>;
}
