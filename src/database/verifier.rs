//! The verification pass.

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::driver::Shared;
use super::error::DatabaseError;
use crate::merkle::{hash_piece, HashTree, NodeHash};
use crate::pieceset::PiecesetDescriptor;
use crate::storage::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pass {
    Complete,
    Cancelled,
}

/// Hashes piece bytes on the blocking pool.
pub(crate) async fn hash_off_thread(data: Bytes) -> Result<NodeHash, StorageError> {
    tokio::task::spawn_blocking(move || hash_piece(&data))
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))
}

/// Checks `leaf` as the hash of piece `index` under the current layout.
///
/// Plain torrents compare against the declared hash. Hash-tree torrents
/// check against the shortest view that covers the whole piece, since
/// different regions of an elastic torrent are committed under different
/// views.
pub(crate) fn leaf_matches(
    shared: &Shared,
    descriptor: &PiecesetDescriptor,
    index: u32,
    leaf: &NodeHash,
) -> bool {
    let Some(tree) = &shared.tree else {
        return shared.info.piece_hash(index) == Some(leaf);
    };
    let Ok(range) = descriptor.piece_range(index) else {
        return false;
    };
    let mut tree = tree.lock();
    let Some(view_length) = tree.ceiling_view(range.end).map(|v| v.length()) else {
        return false;
    };
    tree.verify_leaf_hash(view_length, index, leaf)
}

/// Runs one pass over every piece not yet verified.
///
/// Cancellation is checked once per piece, never in the middle of one.
pub(crate) async fn run(shared: &Shared, cancel: &CancellationToken) -> Result<Pass, DatabaseError> {
    let descriptor = shared.descriptor();
    let count = descriptor.number_of_pieces();
    tracing::debug!(pieces = count, "starting verification");

    let backed = shared.storage.lock().await.storage_backed_pieces().await?;
    for index in 0..count {
        if !backed.has(index as usize) && !shared.verified.has(index as usize) {
            shared.present.clear(index as usize);
            shared.mark_verified(index);
        }
    }

    let fast_path = shared.tree.as_ref().is_some_and(|t| t.lock().view_count() == 1)
        && shared.verified.count() == 0
        && backed.is_complete();
    if fast_path && verify_whole_tree(shared, &descriptor, cancel).await? == Some(Pass::Cancelled) {
        return Ok(Pass::Cancelled);
    }

    for index in 0..count {
        if cancel.is_cancelled() {
            tracing::debug!(piece = index, "verification cancelled");
            return Ok(Pass::Cancelled);
        }
        if shared.verified.has(index as usize) {
            continue;
        }

        let data = shared.storage.lock().await.read(index).await?;
        let leaf = hash_off_thread(data).await?;
        let present = leaf_matches(shared, &descriptor, index, &leaf);
        if present {
            shared.present.set(index as usize);
        } else {
            shared.present.clear(index as usize);
        }
        shared.mark_verified(index);
        tracing::trace!(piece = index, present, "verified piece");
    }

    tracing::debug!(
        present = shared.present.count(),
        pieces = count,
        "verification complete"
    );
    Ok(Pass::Complete)
}

/// Hashes every piece and compares the resulting root with the only view.
///
/// A matching root proves nothing about any single piece on its own, so on
/// a match each leaf is then certified against the view through a proof
/// taken from the freshly built tree. Returns `None` when the pass should
/// fall through to piece-by-piece verification.
async fn verify_whole_tree(
    shared: &Shared,
    descriptor: &PiecesetDescriptor,
    cancel: &CancellationToken,
) -> Result<Option<Pass>, DatabaseError> {
    let Some(tree) = &shared.tree else {
        return Ok(None);
    };
    let Some((view_length, root)) = tree.lock().latest_view().map(|v| (v.length(), v.root())) else {
        return Ok(None);
    };
    if view_length != descriptor.total_length() {
        return Ok(None);
    }

    let count = descriptor.number_of_pieces();
    let mut leaves = Vec::with_capacity(count as usize);
    for index in 0..count {
        if cancel.is_cancelled() {
            return Ok(Some(Pass::Cancelled));
        }
        let data = shared.storage.lock().await.read(index).await?;
        leaves.push(hash_off_thread(data).await?);
    }

    let full = HashTree::build_from_leaves(descriptor.piece_size(), view_length, &leaves)?;
    if full.view(view_length).map(|v| v.root()) != Some(root) {
        tracing::debug!("whole-tree root mismatch; checking pieces one by one");
        return Ok(None);
    }

    let mut tree = tree.lock();
    for (index, leaf) in leaves.iter().enumerate() {
        let index = index as u32;
        let certified = full
            .hash_chain(view_length, index)
            .is_some_and(|chain| tree.verify_hash_chain(&chain))
            && tree.verify_leaf_hash(view_length, index, leaf);
        if certified {
            shared.present.set(index as usize);
            shared.mark_verified(index);
        }
    }
    Ok(Some(Pass::Complete))
}
