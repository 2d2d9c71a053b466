//! Torrent declarations as seen by the piece database.
//!
//! The database only needs a small part of a torrent's metainfo: the piece
//! size, the total length, a stable content identifier and the hashes that
//! pieces are checked against. Those hashes come in three styles:
//!
//! - **Plain** - one SHA1 hash per piece ([`PieceHashes::Flat`]).
//! - **Merkle** - a single root hash over the piece hashes
//!   ([`PieceHashes::Root`]).
//! - **Elastic** - a root hash plus a signature over it
//!   ([`PieceHashes::SignedRoot`]), so the data may later grow through
//!   further signed [`ViewSignature`]s.
//!
//! # Examples
//!
//! ```
//! use piecedb::metainfo::{ContentId, Info, Style};
//! use piecedb::merkle::hash_piece;
//!
//! let data = vec![1u8; 3000];
//! let hashes = data.chunks(1024).map(hash_piece).collect();
//! let info = Info::plain(ContentId::new([9; 20]), 1024, 3000, hashes)?;
//!
//! assert_eq!(info.style(), Style::Plain);
//! assert_eq!(info.descriptor()?.number_of_pieces(), 3);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod error;
mod info;
mod signature;

pub use error::MetainfoError;
pub use info::{ContentId, Info, PieceHashes, Style};
pub use signature::{sign_view, signing_token, verify_view, ViewSignature};
