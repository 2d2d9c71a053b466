use thiserror::Error;

use super::state::State;
use crate::merkle::TreeError;
use crate::metadata::MetadataError;
use crate::metainfo::MetainfoError;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("operation requires state {expected}, database is {actual}")]
    InvalidState { expected: State, actual: State },

    #[error("piece {0} is not present")]
    PieceNotPresent(u32),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("piece {0} still has missing blocks")]
    IncompletePiece(u32),

    #[error("piece {piece} is {expected} bytes, got {actual}")]
    PieceLength {
        piece: u32,
        expected: u32,
        actual: usize,
    },

    #[error("storage layout (piece size {piece_size}, {length} bytes) does not fit the torrent")]
    LayoutMismatch { piece_size: u32, length: u64 },

    #[error("torrent is not elastic")]
    NotElastic,

    #[error("view of {requested} bytes is not longer than the current {current} bytes")]
    ViewNotLonger { current: u64, requested: u64 },

    #[error("view signature does not verify")]
    InvalidViewSignature,

    #[error("signing key does not match the torrent's public key")]
    WrongSigningKey,

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("hash tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("metainfo error: {0}")]
    Metainfo(#[from] MetainfoError),

    #[error("database has shut down")]
    Shutdown,
}
