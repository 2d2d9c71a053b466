//! Binary records for persisting hash-tree state.
//!
//! All integers are big-endian. A node map is a `u32` count followed by
//! `level (u8) ‖ index (u64) ‖ hash (20)` per node, sorted by position.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ed25519_dalek::Signature;

use super::tree::{NodeHash, NodeId, TreeError, View, ViewRecord};
use crate::constants::HASH_LEN;
use crate::metainfo::ViewSignature;

const NODE_RECORD_LEN: usize = 1 + 8 + HASH_LEN;
const SIGNATURE_LEN: usize = 64;

fn need(buf: &mut impl Buf, len: usize, what: &'static str) -> Result<(), TreeError> {
    if buf.remaining() < len {
        return Err(TreeError::Malformed(what));
    }
    Ok(())
}

fn get_hash(buf: &mut impl Buf) -> NodeHash {
    let mut hash = [0u8; HASH_LEN];
    buf.copy_to_slice(&mut hash);
    hash
}

fn put_nodes(out: &mut BytesMut, nodes: &HashMap<NodeId, NodeHash>) {
    let mut sorted: Vec<_> = nodes.iter().collect();
    sorted.sort_unstable_by_key(|(id, _)| **id);

    out.reserve(4 + sorted.len() * NODE_RECORD_LEN);
    out.put_u32(sorted.len() as u32);
    for (id, hash) in sorted {
        out.put_u8(id.level);
        out.put_u64(id.index);
        out.put_slice(hash);
    }
}

/// Encodes a node map.
pub fn encode_nodes(nodes: &HashMap<NodeId, NodeHash>) -> Bytes {
    let mut out = BytesMut::new();
    put_nodes(&mut out, nodes);
    out.freeze()
}

/// Decodes a node map written by [`encode_nodes`].
pub fn decode_nodes(buf: &mut impl Buf) -> Result<HashMap<NodeId, NodeHash>, TreeError> {
    need(buf, 4, "node count")?;
    let count = buf.get_u32() as usize;
    need(buf, count.saturating_mul(NODE_RECORD_LEN), "node records")?;

    let mut nodes = HashMap::with_capacity(count);
    for _ in 0..count {
        let level = buf.get_u8();
        let index = buf.get_u64();
        nodes.insert(NodeId::new(level, index), get_hash(buf));
    }
    Ok(nodes)
}

fn put_view(out: &mut BytesMut, view: &View) {
    out.put_u64(view.length());
    out.put_slice(&view.root());
    put_nodes(out, view.mutable_hashes());
}

fn get_view(buf: &mut impl Buf) -> Result<ViewRecord, TreeError> {
    need(buf, 8 + HASH_LEN, "view header")?;
    let length = buf.get_u64();
    let root = get_hash(buf);
    let mutable = decode_nodes(buf)?;
    Ok(ViewRecord {
        length,
        root,
        mutable,
    })
}

/// Encodes one view: `length (u64) ‖ root (20) ‖ node map`.
pub fn encode_view(view: &View) -> Bytes {
    let mut out = BytesMut::new();
    put_view(&mut out, view);
    out.freeze()
}

pub fn decode_view(buf: &mut impl Buf) -> Result<ViewRecord, TreeError> {
    get_view(buf)
}

/// Encodes a dictionary of views: `count (u32)` then each view.
pub fn encode_views<'a>(views: impl IntoIterator<Item = &'a View>) -> Bytes {
    let views: Vec<_> = views.into_iter().collect();
    let mut out = BytesMut::new();
    out.put_u32(views.len() as u32);
    for view in views {
        put_view(&mut out, view);
    }
    out.freeze()
}

pub fn decode_views(buf: &mut impl Buf) -> Result<Vec<ViewRecord>, TreeError> {
    need(buf, 4, "view count")?;
    let count = buf.get_u32();
    (0..count).map(|_| get_view(buf)).collect()
}

/// Encodes view signatures: `count (u32)` then
/// `length (u64) ‖ root (20) ‖ signature (64)` each.
pub fn encode_signatures<'a>(signatures: impl IntoIterator<Item = &'a ViewSignature>) -> Bytes {
    let signatures: Vec<_> = signatures.into_iter().collect();
    let mut out = BytesMut::with_capacity(4 + signatures.len() * (8 + HASH_LEN + SIGNATURE_LEN));
    out.put_u32(signatures.len() as u32);
    for sig in signatures {
        out.put_u64(sig.view_length());
        out.put_slice(sig.view_root_hash());
        out.put_slice(&sig.signature().to_bytes());
    }
    out.freeze()
}

pub fn decode_signatures(buf: &mut impl Buf) -> Result<Vec<ViewSignature>, TreeError> {
    need(buf, 4, "signature count")?;
    let count = buf.get_u32() as usize;
    need(
        buf,
        count.saturating_mul(8 + HASH_LEN + SIGNATURE_LEN),
        "signature records",
    )?;

    let mut signatures = Vec::with_capacity(count);
    for _ in 0..count {
        let length = buf.get_u64();
        let root = get_hash(buf);
        let mut raw = [0u8; SIGNATURE_LEN];
        buf.copy_to_slice(&mut raw);
        signatures.push(ViewSignature::new(length, root, Signature::from_bytes(&raw)));
    }
    Ok(signatures)
}
