use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("piece size must be non-zero")]
    InvalidPieceSize,

    #[error("total length {0} needs more pieces than a u32 can index")]
    TooManyPieces(u64),

    #[error("piece {piece} is {expected} bytes, got {actual}")]
    LengthMismatch {
        piece: u32,
        expected: u32,
        actual: usize,
    },

    #[error("offset {offset} lies outside piece {piece}")]
    InvalidOffset { piece: u32, offset: u32 },

    #[error("incompatible storage location: {0}")]
    IncompatibleLocation(String),

    #[error("cannot shrink storage from {current} to {requested} bytes")]
    Shrink { current: u64, requested: u64 },

    #[error("{0} bytes exceeds the memory storage limit")]
    TooLarge(u64),

    #[error("storage has no files to extend")]
    NoFiles,

    #[error("storage is closed")]
    Closed,
}
