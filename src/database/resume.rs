//! Restoring and saving state across sessions.
//!
//! The `resume` record is `cookie length (u32) ‖ cookie ‖ piece count (u32)
//! ‖ present bitmap`. It is erased as soon as it has been read, so it can
//! only ever vouch for the session that wrote it.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::driver::Shared;
use super::error::DatabaseError;
use crate::bitfield::Bitfield;
use crate::constants::{
    KEY_ELASTIC_IMMUTABLE, KEY_ELASTIC_VIEW, KEY_ELASTIC_VIEWS, KEY_ELASTIC_VIEW_SIGNATURES,
    KEY_RESUME,
};
use crate::merkle::{
    decode_nodes, decode_signatures, decode_view, decode_views, encode_nodes, encode_signatures,
    encode_view, encode_views, HashTree, TreeError, ViewRecord,
};
use crate::metadata::{Metadata, MetadataError};
use crate::metainfo::{verify_view, Info, Style, ViewSignature};
use crate::storage::Storage;

pub(crate) struct ResumeRecord {
    pub(crate) cookie: Bytes,
    pub(crate) piece_count: u32,
    pub(crate) bitmap: Bytes,
}

impl ResumeRecord {
    pub(crate) fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(8 + self.cookie.len() + self.bitmap.len());
        out.put_u32(self.cookie.len() as u32);
        out.put_slice(&self.cookie);
        out.put_u32(self.piece_count);
        out.put_slice(&self.bitmap);
        out.freeze()
    }

    pub(crate) fn decode(mut buf: Bytes) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        let cookie_len = buf.get_u32() as usize;
        if buf.remaining() < cookie_len + 4 {
            return None;
        }
        let cookie = buf.split_to(cookie_len);
        let piece_count = buf.get_u32();
        Some(Self {
            cookie,
            piece_count,
            bitmap: buf,
        })
    }
}

/// Hash-tree state as persisted.
pub(crate) struct TreeState {
    pub(crate) tree: HashTree,
    pub(crate) signatures: BTreeMap<u64, ViewSignature>,
}

/// A tree that knows only the declared root, plus the declared signature.
pub(crate) fn fresh_tree(info: &Info) -> Option<TreeState> {
    let root = info.root_hash()?;
    let tree = HashTree::empty(info.piece_size(), info.total_length(), root);
    let signatures = info
        .initial_view_signature()
        .map(|sig| (sig.view_length(), sig))
        .into_iter()
        .collect();
    Some(TreeState { tree, signatures })
}

/// Loads persisted tree state, falling back to a fresh tree when none is
/// stored or what is stored does not match the torrent.
pub(crate) async fn load_tree(
    info: &Info,
    metadata: &dyn Metadata,
) -> Result<Option<TreeState>, DatabaseError> {
    let Some(fresh) = fresh_tree(info) else {
        return Ok(None);
    };
    let Some(immutable) = metadata.get(KEY_ELASTIC_IMMUTABLE).await? else {
        return Ok(Some(fresh));
    };

    let restored = match info.style() {
        Style::Merkle => match metadata.get(KEY_ELASTIC_VIEW).await? {
            Some(view) => restore_merkle(info, immutable, view),
            None => return Ok(Some(fresh)),
        },
        _ => {
            let views = metadata.get(KEY_ELASTIC_VIEWS).await?;
            let signatures = metadata.get(KEY_ELASTIC_VIEW_SIGNATURES).await?;
            match (views, signatures) {
                (Some(views), Some(signatures)) => {
                    restore_elastic(info, immutable, views, signatures)
                }
                _ => return Ok(Some(fresh)),
            }
        }
    };

    match restored {
        Ok(Some(state)) => {
            tracing::debug!(views = state.tree.view_count(), "restored hash tree");
            Ok(Some(state))
        }
        Ok(None) => {
            tracing::debug!("persisted hash tree does not match torrent; starting fresh");
            Ok(Some(fresh))
        }
        Err(e) => {
            tracing::warn!(error = %e, "persisted hash tree is malformed; starting fresh");
            Ok(Some(fresh))
        }
    }
}

fn restore_merkle(
    info: &Info,
    mut immutable: Bytes,
    mut view: Bytes,
) -> Result<Option<TreeState>, TreeError> {
    let immutable = decode_nodes(&mut immutable)?;
    let view = decode_view(&mut view)?;
    if view.length != info.total_length() || Some(view.root) != info.root_hash() {
        return Ok(None);
    }
    Ok(Some(TreeState {
        tree: HashTree::with_node_hashes(info.piece_size(), immutable, [view]),
        signatures: BTreeMap::new(),
    }))
}

fn restore_elastic(
    info: &Info,
    mut immutable: Bytes,
    mut views: Bytes,
    mut signatures: Bytes,
) -> Result<Option<TreeState>, TreeError> {
    let immutable = decode_nodes(&mut immutable)?;
    let views = decode_views(&mut views)?;
    let signatures: BTreeMap<u64, ViewSignature> = decode_signatures(&mut signatures)?
        .into_iter()
        .map(|sig| (sig.view_length(), sig))
        .collect();

    let (Some(public_key), Some(declared)) = (info.public_key(), info.initial_view_signature())
    else {
        return Ok(None);
    };

    // Only views backed by a valid signature over their own root survive.
    let mut kept = BTreeMap::new();
    let views: Vec<ViewRecord> = views
        .into_iter()
        .filter(|view| match signatures.get(&view.length) {
            Some(sig) if *sig.view_root_hash() == view.root => {
                let valid = verify_view(public_key, info.content_id(), sig);
                if valid {
                    kept.insert(view.length, *sig);
                }
                valid
            }
            _ => false,
        })
        .collect();

    if views.is_empty() {
        return Ok(None);
    }
    if let Some(view) = views.iter().find(|v| v.length == declared.view_length()) {
        if view.root != *declared.view_root_hash() {
            return Ok(None);
        }
    }

    let mut tree = HashTree::with_node_hashes(info.piece_size(), immutable, views);
    if tree.view(declared.view_length()).is_none() {
        tree.add_view(declared.view_length(), *declared.view_root_hash())?;
    }
    kept.insert(declared.view_length(), declared);
    Ok(Some(TreeState {
        tree,
        signatures: kept,
    }))
}

/// Reads and erases the resume record, returning the present bitmap if the
/// storage still matches the cookie it was saved with.
pub(crate) async fn take_bitmap(
    storage: &dyn Storage,
    metadata: &dyn Metadata,
) -> Result<Option<Bitfield>, DatabaseError> {
    let record = metadata.get(KEY_RESUME).await?;
    metadata.put(KEY_RESUME, None).await?;
    let Some(record) = record else {
        return Ok(None);
    };

    let Some(record) = ResumeRecord::decode(record) else {
        tracing::debug!("resume record is malformed; verifying from scratch");
        return Ok(None);
    };

    let pieces = storage.descriptor().number_of_pieces();
    if record.piece_count != pieces || record.bitmap.len() != (pieces as usize).div_ceil(8) {
        tracing::debug!(
            saved = record.piece_count,
            current = pieces,
            "resume bitmap length mismatch; verifying from scratch"
        );
        return Ok(None);
    }
    if !storage.validate(Some(&record.cookie)).await? {
        tracing::debug!("storage changed since last session; verifying from scratch");
        return Ok(None);
    }

    tracing::debug!(pieces, "resume record accepted");
    Ok(Some(Bitfield::from_bytes(&record.bitmap, pieces as usize)))
}

/// Saves tree state, then the resume record.
///
/// The resume record goes last so a failure part way leaves no record
/// vouching for state that was never written.
pub(crate) async fn persist(
    shared: &Shared,
    metadata: &dyn Metadata,
    cookie: Bytes,
) -> Result<(), MetadataError> {
    let tree_records = shared.tree.as_ref().map(|tree| {
        let tree = tree.lock();
        let immutable = encode_nodes(tree.immutable_hashes());
        match shared.info.style() {
            Style::Merkle => {
                let view = tree
                    .view(shared.info.total_length())
                    .map(encode_view)
                    .unwrap_or_default();
                vec![(KEY_ELASTIC_IMMUTABLE, immutable), (KEY_ELASTIC_VIEW, view)]
            }
            _ => {
                let views = encode_views(tree.all_views());
                let signatures = encode_signatures(shared.signatures.lock().values());
                vec![
                    (KEY_ELASTIC_IMMUTABLE, immutable),
                    (KEY_ELASTIC_VIEWS, views),
                    (KEY_ELASTIC_VIEW_SIGNATURES, signatures),
                ]
            }
        }
    });

    for (key, value) in tree_records.into_iter().flatten() {
        metadata.put(key, Some(value)).await?;
    }

    let present = shared.present.snapshot();
    let record = ResumeRecord {
        cookie,
        piece_count: present.len() as u32,
        bitmap: present.to_bytes(),
    };
    metadata.put(KEY_RESUME, Some(record.encode())).await?;
    tracing::debug!(present = present.count(), "saved resume state");
    Ok(())
}
