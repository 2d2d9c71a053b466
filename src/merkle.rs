//! Hash trees over piece hashes, with growable views.
//!
//! Merkle and elastic torrents declare a single root hash instead of one
//! hash per piece. The tree's leaves are the SHA1 hashes of the pieces, padded
//! with zero hashes up to a power of two; each parent is the SHA1 of its two
//! children concatenated.
//!
//! An elastic torrent's data may grow, so the tree is kept as a set of
//! *views*: a view is the tree over the first `length` bytes, identified by
//! its own root. Nodes whose leaves are all full pieces within a view never
//! change when the data grows, so they are stored once and shared by every
//! view; the remaining nodes (the ragged right edge) are stored per view.
//!
//! # Examples
//!
//! ```
//! use piecedb::merkle::{hash_piece, HashTree};
//!
//! let data = vec![3u8; 5000];
//! let leaves: Vec<_> = data.chunks(1024).map(hash_piece).collect();
//! let full = HashTree::build_from_leaves(1024, 5000, &leaves)?;
//! let root = full.view(5000).unwrap().root();
//!
//! // A peer that only knows the root can check a piece with a proof.
//! let mut partial = HashTree::empty(1024, 5000, root);
//! let chain = full.hash_chain(5000, 2).unwrap();
//! assert!(partial.verify_hash_chain(&chain));
//! assert!(partial.verify_leaf_hash(5000, 2, &leaves[2]));
//! # Ok::<(), piecedb::merkle::TreeError>(())
//! ```

mod chain;
mod codec;
mod tree;

pub use chain::HashChain;
pub use codec::{
    decode_nodes, decode_signatures, decode_view, decode_views, encode_nodes, encode_signatures,
    encode_view, encode_views,
};
pub use tree::{hash_pair, hash_piece, HashTree, NodeHash, NodeId, TreeError, View, ViewRecord};
