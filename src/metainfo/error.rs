use thiserror::Error;

/// Errors raised while building an [`Info`](super::Info).
#[derive(Debug, Error)]
pub enum MetainfoError {
    /// The piece size is zero.
    #[error("piece size must be non-zero")]
    InvalidPieceSize,

    /// A flat hash list does not have one hash per piece.
    #[error("expected {expected} piece hashes, got {actual}")]
    PieceCountMismatch { expected: u32, actual: usize },

    /// The layout has more pieces than a `u32` index can address.
    #[error("total length {0} needs too many pieces")]
    TooManyPieces(u64),

    /// The public key bytes are not a valid key.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// The initial view signature does not verify against the public key.
    #[error("initial view signature does not verify")]
    InvalidSignature,
}
