use std::collections::{BTreeMap, HashMap};

use sha1::{Digest, Sha1};
use thiserror::Error;

use super::chain::HashChain;
use crate::constants::HASH_LEN;

/// A SHA1 tree node.
pub type NodeHash = [u8; HASH_LEN];

const ZERO: NodeHash = [0; HASH_LEN];

/// Position of a node: `level` 0 holds the leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub level: u8,
    pub index: u64,
}

impl NodeId {
    pub fn new(level: u8, index: u64) -> Self {
        Self { level, index }
    }

    fn sibling(self) -> Self {
        Self::new(self.level, self.index ^ 1)
    }

    fn parent(self) -> Self {
        Self::new(self.level + 1, self.index >> 1)
    }

    fn first_leaf(self) -> u128 {
        (self.index as u128) << self.level
    }

    fn end_leaf(self) -> u128 {
        (self.index as u128 + 1) << self.level
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("view of {0} bytes already has a different root")]
    ConflictingRoot(u64),

    #[error("no view of {0} bytes")]
    UnknownView(u64),

    #[error("a view of {length} bytes needs {expected} leaves, got {actual}")]
    LeafCountMismatch {
        length: u64,
        expected: u64,
        actual: usize,
    },

    #[error("malformed hash tree record: {0}")]
    Malformed(&'static str),
}

/// The tree over the first `length` bytes of the data.
#[derive(Debug, Clone)]
pub struct View {
    length: u64,
    leaf_count: u64,
    depth: u8,
    root: NodeHash,
    mutable: HashMap<NodeId, NodeHash>,
}

impl View {
    fn new(piece_size: u32, length: u64, root: NodeHash) -> Self {
        let (leaf_count, depth) = shape(piece_size, length);
        Self {
            length,
            leaf_count,
            depth,
            root,
            mutable: HashMap::new(),
        }
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn root(&self) -> NodeHash {
        self.root
    }

    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    /// Number of levels above the leaves.
    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// Known nodes that belong to this view alone.
    pub fn mutable_hashes(&self) -> &HashMap<NodeId, NodeHash> {
        &self.mutable
    }

    fn root_id(&self) -> NodeId {
        NodeId::new(self.depth, 0)
    }
}

/// Leaf count and depth of the tree over `length` bytes.
fn shape(piece_size: u32, length: u64) -> (u64, u8) {
    let leaves = length.div_ceil(piece_size as u64);
    let width = leaves.max(1).next_power_of_two();
    (leaves, width.trailing_zeros() as u8)
}

/// A node is shared by all views once every leaf under it is a full piece
/// inside the view.
fn is_immutable(piece_size: u32, view_length: u64, id: NodeId) -> bool {
    id.end_leaf() * piece_size as u128 <= view_length as u128
}

fn padding_hash(level: u8) -> NodeHash {
    (0..level).fold(ZERO, |h, _| hash_pair(&h, &h))
}

/// Hashes two child nodes into their parent.
pub fn hash_pair(left: &NodeHash, right: &NodeHash) -> NodeHash {
    let mut hasher = Sha1::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Hashes the raw bytes of a piece into a leaf (and a plain piece hash).
pub fn hash_piece(data: &[u8]) -> NodeHash {
    Sha1::digest(data).into()
}

fn compute_levels(leaves: &[NodeHash], depth: u8) -> Vec<Vec<NodeHash>> {
    let mut level = leaves.to_vec();
    level.resize(1usize << depth, ZERO);

    let mut levels = Vec::with_capacity(depth as usize + 1);
    while level.len() > 1 {
        let next = level
            .chunks(2)
            .map(|pair| hash_pair(&pair[0], &pair[1]))
            .collect();
        levels.push(std::mem::replace(&mut level, next));
    }
    levels.push(level);
    levels
}

/// Known hashes of a piece hash tree, organised as views.
#[derive(Debug, Clone)]
pub struct HashTree {
    piece_size: u32,
    immutable: HashMap<NodeId, NodeHash>,
    views: BTreeMap<u64, View>,
}

impl HashTree {
    /// A tree that knows nothing yet.
    pub fn new(piece_size: u32) -> Self {
        Self {
            piece_size,
            immutable: HashMap::new(),
            views: BTreeMap::new(),
        }
    }

    /// A tree that only knows the root of the view at `length`.
    pub fn empty(piece_size: u32, length: u64, root: NodeHash) -> Self {
        let mut tree = Self::new(piece_size);
        tree.views.insert(length, View::new(piece_size, length, root));
        tree
    }

    /// A tree computed entirely from the leaves of the view at `length`.
    pub fn build_from_leaves(
        piece_size: u32,
        length: u64,
        leaves: &[NodeHash],
    ) -> Result<Self, TreeError> {
        let mut tree = Self::new(piece_size);
        tree.add_view_from_leaves(length, leaves)?;
        Ok(tree)
    }

    /// Rebuilds a tree from persisted node hashes.
    pub fn with_node_hashes(
        piece_size: u32,
        immutable: HashMap<NodeId, NodeHash>,
        views: impl IntoIterator<Item = ViewRecord>,
    ) -> Self {
        let mut tree = Self::new(piece_size);
        tree.immutable = immutable;
        for record in views {
            let mut view = View::new(piece_size, record.length, record.root);
            view.mutable = record.mutable;
            tree.views.insert(record.length, view);
        }
        tree
    }

    pub fn piece_size(&self) -> u32 {
        self.piece_size
    }

    /// Registers the view at `length` with the given root.
    ///
    /// Returns `false` if the view was already known with the same root.
    pub fn add_view(&mut self, length: u64, root: NodeHash) -> Result<bool, TreeError> {
        match self.views.get(&length) {
            Some(view) if view.root == root => Ok(false),
            Some(_) => Err(TreeError::ConflictingRoot(length)),
            None => {
                self.views
                    .insert(length, View::new(self.piece_size, length, root));
                Ok(true)
            }
        }
    }

    /// Computes and registers the view at `length` from all of its leaves,
    /// remembering every node. Returns the view's root.
    pub fn add_view_from_leaves(
        &mut self,
        length: u64,
        leaves: &[NodeHash],
    ) -> Result<NodeHash, TreeError> {
        let (expected, depth) = shape(self.piece_size, length);
        if leaves.len() as u64 != expected {
            return Err(TreeError::LeafCountMismatch {
                length,
                expected,
                actual: leaves.len(),
            });
        }

        let levels = compute_levels(leaves, depth);
        let root = levels[depth as usize][0];
        self.add_view(length, root)?;

        for (level, hashes) in levels.iter().enumerate() {
            for (index, hash) in hashes.iter().enumerate() {
                self.store(length, NodeId::new(level as u8, index as u64), *hash);
            }
        }
        Ok(root)
    }

    pub fn view(&self, length: u64) -> Option<&View> {
        self.views.get(&length)
    }

    /// The shortest view covering linear byte offset `byte_offset`.
    pub fn ceiling_view(&self, byte_offset: u64) -> Option<&View> {
        self.views.range(byte_offset..).next().map(|(_, v)| v)
    }

    /// The longest known view.
    pub fn latest_view(&self) -> Option<&View> {
        self.views.values().next_back()
    }

    /// Every view, shortest first.
    pub fn all_views(&self) -> impl Iterator<Item = &View> {
        self.views.values()
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Hash of leaf `index` in the view at `view_length`, if known.
    pub fn known_leaf(&self, view_length: u64, index: u32) -> Option<NodeHash> {
        let view = self.views.get(&view_length)?;
        if index as u64 >= view.leaf_count {
            return None;
        }
        self.lookup(view, NodeId::new(0, index as u64))
    }

    /// Builds a proof of leaf `index` against the view at `view_length`.
    ///
    /// Returns `None` unless the leaf and every sibling on its path are known.
    pub fn hash_chain(&self, view_length: u64, index: u32) -> Option<HashChain> {
        let view = self.views.get(&view_length)?;
        if index as u64 >= view.leaf_count {
            return None;
        }

        let mut id = NodeId::new(0, index as u64);
        let leaf = self.lookup(view, id)?;
        let mut uncles = Vec::with_capacity(view.depth as usize);
        while id.level < view.depth {
            uncles.push(self.lookup(view, id.sibling())?);
            id = id.parent();
        }
        Some(HashChain::new(view_length, index, leaf, uncles))
    }

    /// Checks a proof against its view's root; on success every node the
    /// proof touches becomes known.
    pub fn verify_hash_chain(&mut self, chain: &HashChain) -> bool {
        let Some(view) = self.views.get(&chain.view_length()) else {
            return false;
        };
        let index = chain.piece_index() as u64;
        if index >= view.leaf_count || chain.uncles().len() != view.depth as usize {
            return false;
        }
        let root = view.root;

        let mut id = NodeId::new(0, index);
        let mut hash = *chain.leaf();
        let mut proven = Vec::with_capacity(chain.uncles().len() * 2 + 1);
        proven.push((id, hash));
        for uncle in chain.uncles() {
            proven.push((id.sibling(), *uncle));
            hash = if id.index % 2 == 0 {
                hash_pair(&hash, uncle)
            } else {
                hash_pair(uncle, &hash)
            };
            id = id.parent();
            proven.push((id, hash));
        }

        if hash != root {
            return false;
        }
        for (id, hash) in proven {
            self.store(chain.view_length(), id, hash);
        }
        true
    }

    /// Checks `leaf` as leaf `index` of the view at `view_length` using only
    /// nodes already known; on success the computed path becomes known.
    pub fn verify_leaf_hash(&mut self, view_length: u64, index: u32, leaf: &NodeHash) -> bool {
        let Some(view) = self.views.get(&view_length) else {
            return false;
        };
        if index as u64 >= view.leaf_count {
            return false;
        }

        let mut id = NodeId::new(0, index as u64);
        let mut hash = *leaf;
        let mut path = Vec::new();
        loop {
            if let Some(known) = self.lookup(view, id) {
                if known != hash {
                    return false;
                }
                break;
            }
            let Some(sibling) = self.lookup(view, id.sibling()) else {
                return false;
            };
            path.push((id, hash));
            hash = if id.index % 2 == 0 {
                hash_pair(&hash, &sibling)
            } else {
                hash_pair(&sibling, &hash)
            };
            id = id.parent();
        }

        for (id, hash) in path {
            self.store(view_length, id, hash);
        }
        true
    }

    /// Nodes shared by every view.
    pub fn immutable_hashes(&self) -> &HashMap<NodeId, NodeHash> {
        &self.immutable
    }

    /// Nodes specific to the view at `view_length`.
    pub fn mutable_hashes(&self, view_length: u64) -> Option<&HashMap<NodeId, NodeHash>> {
        self.views.get(&view_length).map(View::mutable_hashes)
    }

    /// Drops every view `keep` rejects, returning the dropped lengths.
    pub fn garbage_collect_views(&mut self, keep: impl Fn(&View) -> bool) -> Vec<u64> {
        let dropped: Vec<u64> = self
            .views
            .values()
            .filter(|v| !keep(v))
            .map(View::length)
            .collect();
        for length in &dropped {
            self.views.remove(length);
        }
        dropped
    }

    fn lookup(&self, view: &View, id: NodeId) -> Option<NodeHash> {
        if id.level > view.depth {
            return None;
        }
        if id == view.root_id() {
            return Some(view.root);
        }
        if id.first_leaf() >= view.leaf_count as u128 {
            return Some(padding_hash(id.level));
        }
        if is_immutable(self.piece_size, view.length, id) {
            self.immutable.get(&id).copied()
        } else {
            view.mutable.get(&id).copied()
        }
    }

    fn store(&mut self, view_length: u64, id: NodeId, hash: NodeHash) {
        let piece_size = self.piece_size;
        let Some(view) = self.views.get_mut(&view_length) else {
            return;
        };
        if id.level > view.depth || id.first_leaf() >= view.leaf_count as u128 {
            return;
        }
        if is_immutable(piece_size, view.length, id) {
            self.immutable.insert(id, hash);
        } else if id != view.root_id() {
            view.mutable.insert(id, hash);
        }
    }
}

/// A view as persisted: its length, root and view-specific nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewRecord {
    pub length: u64,
    pub root: NodeHash,
    pub mutable: HashMap<NodeId, NodeHash>,
}

impl From<&View> for ViewRecord {
    fn from(view: &View) -> Self {
        Self {
            length: view.length,
            root: view.root,
            mutable: view.mutable.clone(),
        }
    }
}
