use super::tree::NodeHash;

/// A proof that a leaf belongs to a view: the leaf hash plus the sibling
/// ("uncle") hash at every level from the leaf up to the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashChain {
    view_length: u64,
    piece_index: u32,
    leaf: NodeHash,
    uncles: Vec<NodeHash>,
}

impl HashChain {
    pub fn new(view_length: u64, piece_index: u32, leaf: NodeHash, uncles: Vec<NodeHash>) -> Self {
        Self {
            view_length,
            piece_index,
            leaf,
            uncles,
        }
    }

    /// Length of the view this chain proves against.
    pub fn view_length(&self) -> u64 {
        self.view_length
    }

    pub fn piece_index(&self) -> u32 {
        self.piece_index
    }

    pub fn leaf(&self) -> &NodeHash {
        &self.leaf
    }

    /// Sibling hashes, bottom level first.
    pub fn uncles(&self) -> &[NodeHash] {
        &self.uncles
    }
}
