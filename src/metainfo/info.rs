use std::fmt;

use ed25519_dalek::{Signature, VerifyingKey};

use super::error::MetainfoError;
use super::signature::{verify_view, ViewSignature};
use crate::constants::HASH_LEN;
use crate::pieceset::PiecesetDescriptor;
use crate::storage::StorageError;

/// Stable 20-byte identifier of a torrent's content (its info hash).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId(pub [u8; HASH_LEN]);

impl ContentId {
    pub fn new(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().fold(String::with_capacity(HASH_LEN * 2), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.to_hex())
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// How pieces of a torrent are verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Style {
    /// One SHA1 hash per piece.
    Plain,
    /// A fixed merkle root over the piece hashes.
    Merkle,
    /// A signed merkle root whose data may grow through signed views.
    Elastic,
}

impl Style {
    /// Returns true if pieces are verified through a hash tree.
    pub fn uses_hash_tree(&self) -> bool {
        matches!(self, Style::Merkle | Style::Elastic)
    }
}

/// The hashes a torrent declares for its pieces.
#[derive(Debug, Clone)]
pub enum PieceHashes {
    Flat(Vec<[u8; HASH_LEN]>),
    Root([u8; HASH_LEN]),
    SignedRoot {
        root: [u8; HASH_LEN],
        signature: Signature,
        public_key: VerifyingKey,
    },
}

/// The immutable torrent declaration a piece database is built from.
#[derive(Debug, Clone)]
pub struct Info {
    content_id: ContentId,
    piece_size: u32,
    total_length: u64,
    hashes: PieceHashes,
}

impl Info {
    /// Declares a plain torrent with one hash per piece.
    pub fn plain(
        content_id: ContentId,
        piece_size: u32,
        total_length: u64,
        piece_hashes: Vec<[u8; HASH_LEN]>,
    ) -> Result<Self, MetainfoError> {
        let descriptor = layout(piece_size, total_length)?;
        if piece_hashes.len() != descriptor.number_of_pieces() as usize {
            return Err(MetainfoError::PieceCountMismatch {
                expected: descriptor.number_of_pieces(),
                actual: piece_hashes.len(),
            });
        }
        Ok(Self {
            content_id,
            piece_size,
            total_length,
            hashes: PieceHashes::Flat(piece_hashes),
        })
    }

    /// Declares a merkle torrent anchored at `root`.
    pub fn merkle(
        content_id: ContentId,
        piece_size: u32,
        total_length: u64,
        root: [u8; HASH_LEN],
    ) -> Result<Self, MetainfoError> {
        layout(piece_size, total_length)?;
        Ok(Self {
            content_id,
            piece_size,
            total_length,
            hashes: PieceHashes::Root(root),
        })
    }

    /// Declares an elastic torrent whose initial view is signed by the owner
    /// of `public_key`.
    ///
    /// # Errors
    ///
    /// Returns [`MetainfoError::InvalidSignature`] if `signature` does not
    /// sign `(content_id, total_length, root)`.
    pub fn elastic(
        content_id: ContentId,
        piece_size: u32,
        total_length: u64,
        root: [u8; HASH_LEN],
        signature: Signature,
        public_key: VerifyingKey,
    ) -> Result<Self, MetainfoError> {
        layout(piece_size, total_length)?;
        let initial = ViewSignature::new(total_length, root, signature);
        if !verify_view(&public_key, &content_id, &initial) {
            return Err(MetainfoError::InvalidSignature);
        }
        Ok(Self {
            content_id,
            piece_size,
            total_length,
            hashes: PieceHashes::SignedRoot {
                root,
                signature,
                public_key,
            },
        })
    }

    pub fn content_id(&self) -> &ContentId {
        &self.content_id
    }

    pub fn piece_size(&self) -> u32 {
        self.piece_size
    }

    /// Length declared by the torrent itself, before any elastic growth.
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn hashes(&self) -> &PieceHashes {
        &self.hashes
    }

    pub fn style(&self) -> Style {
        match self.hashes {
            PieceHashes::Flat(_) => Style::Plain,
            PieceHashes::Root(_) => Style::Merkle,
            PieceHashes::SignedRoot { .. } => Style::Elastic,
        }
    }

    /// Declared merkle root, for merkle and elastic torrents.
    pub fn root_hash(&self) -> Option<[u8; HASH_LEN]> {
        match self.hashes {
            PieceHashes::Flat(_) => None,
            PieceHashes::Root(root) | PieceHashes::SignedRoot { root, .. } => Some(root),
        }
    }

    pub fn public_key(&self) -> Option<&VerifyingKey> {
        match &self.hashes {
            PieceHashes::SignedRoot { public_key, .. } => Some(public_key),
            _ => None,
        }
    }

    /// The signature covering the declared view, for elastic torrents.
    pub fn initial_view_signature(&self) -> Option<ViewSignature> {
        match &self.hashes {
            PieceHashes::SignedRoot {
                root, signature, ..
            } => Some(ViewSignature::new(self.total_length, *root, *signature)),
            _ => None,
        }
    }

    /// Declared hash of piece `index`, for plain torrents.
    pub fn piece_hash(&self, index: u32) -> Option<&[u8; HASH_LEN]> {
        match &self.hashes {
            PieceHashes::Flat(hashes) => hashes.get(index as usize),
            _ => None,
        }
    }

    /// The declared piece layout.
    pub fn descriptor(&self) -> Result<PiecesetDescriptor, StorageError> {
        PiecesetDescriptor::new(self.piece_size, self.total_length)
    }
}

fn layout(piece_size: u32, total_length: u64) -> Result<PiecesetDescriptor, MetainfoError> {
    PiecesetDescriptor::new(piece_size, total_length).map_err(|e| match e {
        StorageError::TooManyPieces(len) => MetainfoError::TooManyPieces(len),
        _ => MetainfoError::InvalidPieceSize,
    })
}
