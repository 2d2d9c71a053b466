//! piecedb - A verified piece database for BitTorrent-style content
//!
//! This library keeps track of which pieces of a torrent are present and
//! verified on some storage, checks every write against the torrent's
//! hashes, and lets elastic torrents grow through signed views.
//!
//! # Modules
//!
//! - [`pieceset`] - Piece layout arithmetic
//! - [`piece`] - Pieces and the blocks they are assembled from
//! - [`storage`] - File-backed and in-memory piece storage
//! - [`metainfo`] - Torrent declarations and view signatures
//! - [`merkle`] - Hash trees, hash chains and views
//! - [`metadata`] - Key/value stores for resume state
//! - [`database`] - The piece database and its lifecycle

pub mod bitfield;
pub mod constants;
pub mod database;
pub mod merkle;
pub mod metadata;
pub mod metainfo;
pub mod piece;
pub mod pieceset;
pub mod storage;

pub use bitfield::Bitfield;
pub use database::{DatabaseError, DatabaseListener, DatabaseOptions, PieceDatabase, State};
pub use merkle::{HashChain, HashTree, TreeError};
pub use metadata::{DirMetadata, MemoryMetadata, Metadata, MetadataError};
pub use metainfo::{ContentId, Info, MetainfoError, Style, ViewSignature};
pub use piece::{BlockDescriptor, Piece};
pub use pieceset::PiecesetDescriptor;
pub use storage::{FileEntry, FileStorage, MemoryStorage, Storage, StorageError};
