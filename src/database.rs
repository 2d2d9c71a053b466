//! The piece database.
//!
//! A [`PieceDatabase`] reconciles a torrent's declared piece layout with a
//! [`Storage`]. It tracks which pieces are *present* (written and verified
//! correct) and which are *verified* (checked at least once, present or
//! not), gates reads and writes on its lifecycle [`State`], and for elastic
//! torrents grows the layout through signed views.
//!
//! # Lifecycle
//!
//! ```text
//!            start              complete
//! STOPPED ─────────► CHECKING ─────────► AVAILABLE
//!  ▲  ▲                 │ stop               │
//!  │  │   pass ends     ▼                    │
//!  │  └───────────── STOPPING                │
//!  └─────────────────────────────────────────┘ stop
//! ```
//!
//! An I/O fault anywhere drives the database to `ERROR` and discards all
//! verification state; `start` from `ERROR` verifies from scratch.
//! `terminate` waits for any running pass, closes the storage, persists
//! resume state when every piece has been verified, and ends in
//! `TERMINATED`.
//!
//! # Concurrency
//!
//! Lifecycle inputs go through a single-consumer queue drained by one
//! driver task, so transitions never race. Piece operations take the same
//! state-machine lock as transitions. The present and verified bitfields
//! have their own locks, letting the verifier run without that broad lock.
//!
//! # Examples
//!
//! ```
//! use piecedb::database::{DatabaseOptions, PieceDatabase, State};
//! use piecedb::merkle::hash_piece;
//! use piecedb::metainfo::{ContentId, Info};
//! use piecedb::piece::Piece;
//! use piecedb::storage::MemoryStorage;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let data = vec![42u8; 3000];
//! let hashes = data.chunks(1024).map(hash_piece).collect();
//! let info = Info::plain(ContentId::new([1; 20]), 1024, 3000, hashes)?;
//! let storage = MemoryStorage::new(1024, 3000)?;
//!
//! let db = PieceDatabase::open(info, Box::new(storage), DatabaseOptions::new()).await?;
//! assert_eq!(db.start(true).await?, State::Available);
//!
//! assert!(db.write_piece(Piece::complete(0, data[..1024].to_vec())).await?);
//! assert_eq!(db.read_piece(0).await?.content(), &data[..1024]);
//!
//! db.terminate(true).await?;
//! # Ok(())
//! # }
//! ```

mod driver;
mod error;
mod resume;
mod state;
mod verifier;

pub use error::DatabaseError;
pub use state::State;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bitfield::Bitfield;
use crate::metadata::Metadata;
use crate::metainfo::{sign_view, verify_view, Info, Style, ViewSignature};
use crate::piece::Piece;
use crate::pieceset::PiecesetDescriptor;
use crate::storage::{Storage, StorageError};
use driver::{Ops, Parts, Shared, Status};
use state::Input;

/// States that end a synchronous [`PieceDatabase::start`].
pub const START_TARGETS: &[State] = &[
    State::Available,
    State::Stopped,
    State::Error,
    State::Terminated,
];

/// States that end a synchronous [`PieceDatabase::stop`].
pub const STOP_TARGETS: &[State] = &[State::Stopped, State::Error, State::Terminated];

/// States that end a synchronous [`PieceDatabase::terminate`].
pub const TERMINATE_TARGETS: &[State] = &[State::Terminated];

/// Lifecycle notifications.
///
/// Called from the driver task while it holds the state-machine lock, so
/// implementations must return quickly and must not call back into the
/// database.
pub trait DatabaseListener: Send + Sync {
    fn available(&self) {}
    fn stopped(&self) {}
    fn error(&self) {}
    fn terminated(&self) {}
}

/// Optional collaborators of a [`PieceDatabase`].
#[derive(Default)]
pub struct DatabaseOptions {
    metadata: Option<Box<dyn Metadata>>,
    listener: Option<Arc<dyn DatabaseListener>>,
}

impl DatabaseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persists resume state in `metadata`.
    pub fn with_metadata(mut self, metadata: impl Metadata + 'static) -> Self {
        self.metadata = Some(Box::new(metadata));
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn DatabaseListener>) -> Self {
        self.listener = Some(listener);
        self
    }
}

/// A verified view of a torrent's pieces on top of a [`Storage`].
pub struct PieceDatabase {
    shared: Arc<Shared>,
    status: watch::Receiver<Status>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl PieceDatabase {
    /// Opens a database in the `Stopped` state.
    ///
    /// With a metadata store, persisted hash-tree state is restored and the
    /// storage is extended to the longest restored view. The saved present
    /// bitmap is then accepted only if the storage still matches the cookie
    /// it was saved with.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::LayoutMismatch`] if the storage's piece size
    /// differs from the torrent's or the storage is shorter than the
    /// torrent, and an I/O error if metadata or storage fail.
    pub async fn open(
        info: Info,
        mut storage: Box<dyn Storage>,
        options: DatabaseOptions,
    ) -> Result<Self, DatabaseError> {
        let layout = storage.descriptor();
        if layout.piece_size() != info.piece_size() || layout.total_length() < info.total_length()
        {
            return Err(DatabaseError::LayoutMismatch {
                piece_size: layout.piece_size(),
                length: layout.total_length(),
            });
        }

        let mut tree_state = resume::fresh_tree(&info);
        let mut bitmap = None;
        if let Some(metadata) = &options.metadata {
            tree_state = resume::load_tree(&info, metadata.as_ref()).await?;
            let longest = tree_state
                .as_ref()
                .and_then(|s| s.tree.latest_view())
                .map(|v| v.length());
            if let Some(longest) = longest.filter(|&len| len > storage.descriptor().total_length())
            {
                storage.extend(longest).await?;
            }
            bitmap = resume::take_bitmap(storage.as_ref(), metadata.as_ref()).await?;
        }

        let (tree, signatures) = match tree_state {
            Some(state) => (Some(state.tree), state.signatures),
            None => (None, Default::default()),
        };
        let (shared, status, driver) = Shared::spawn(Parts {
            info,
            storage,
            metadata: options.metadata,
            listener: options.listener,
            tree,
            signatures,
        });

        if let Some(bitmap) = bitmap {
            let pieces = bitmap.len();
            shared.present.replace(bitmap);
            shared.verified.replace(Bitfield::full(pieces));
            shared.verified_count.store(pieces as u64, Ordering::SeqCst);
        }

        Ok(Self {
            shared,
            status,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// The torrent this database serves.
    pub fn info(&self) -> &Info {
        &self.shared.info
    }

    /// Current state as last published by the driver.
    pub fn state(&self) -> State {
        self.status.borrow().state
    }

    /// The current layout, including any elastic growth.
    pub fn descriptor(&self) -> PiecesetDescriptor {
        self.shared.descriptor()
    }

    pub fn have_piece(&self, index: u32) -> bool {
        self.shared.present.has(index as usize)
    }

    pub fn is_verified(&self, index: u32) -> bool {
        self.shared.verified.has(index as usize)
    }

    pub fn present_pieces(&self) -> Bitfield {
        self.shared.present.snapshot()
    }

    pub fn verified_pieces(&self) -> Bitfield {
        self.shared.verified.snapshot()
    }

    /// Number of verified pieces. Safe to poll from anywhere; it only grows
    /// during a pass and drops to zero on error.
    pub fn verified_piece_count(&self) -> u64 {
        self.shared.verified_count.load(Ordering::Relaxed)
    }

    /// Signatures of every known view, shortest first.
    pub fn view_signatures(&self) -> Vec<ViewSignature> {
        self.shared.signatures.lock().values().copied().collect()
    }

    /// Length of the longest known hash-tree view.
    pub fn latest_view_length(&self) -> Option<u64> {
        let tree = self.shared.tree.as_ref()?;
        let length = tree.lock().latest_view().map(|v| v.length());
        length
    }

    /// Starts verification. With `synchronous`, waits until the database is
    /// available, stopped, errored or terminated.
    pub async fn start(&self, synchronous: bool) -> Result<State, DatabaseError> {
        self.request(Input::Start, synchronous, START_TARGETS).await
    }

    /// Stops the database, cancelling a running pass.
    pub async fn stop(&self, synchronous: bool) -> Result<State, DatabaseError> {
        self.request(Input::Stop, synchronous, STOP_TARGETS).await
    }

    /// Shuts the database down for good. A synchronous terminate also waits
    /// for the driver task to exit.
    pub async fn terminate(&self, synchronous: bool) -> Result<State, DatabaseError> {
        let state = self
            .request(Input::Terminate, synchronous, TERMINATE_TARGETS)
            .await?;
        if synchronous {
            let driver = self.driver.lock().take();
            if let Some(driver) = driver {
                if let Err(e) = driver.await {
                    tracing::warn!(error = %e, "database driver failed");
                }
            }
        }
        Ok(state)
    }

    /// Waits until the published state is one of `targets`.
    pub async fn wait_for_state(&self, targets: &[State]) -> Result<State, DatabaseError> {
        self.wait(0, targets).await
    }

    async fn request(
        &self,
        input: Input,
        synchronous: bool,
        targets: &[State],
    ) -> Result<State, DatabaseError> {
        let id = self.shared.submit(input);
        if !synchronous {
            return Ok(self.state());
        }
        self.wait(id, targets).await
    }

    /// Waits for the driver to have handled input `id` and to sit in one of
    /// `targets`. Termination ends every wait.
    async fn wait(&self, id: u64, targets: &[State]) -> Result<State, DatabaseError> {
        let mut status = self.status.clone();
        let reached = status
            .wait_for(|s| {
                s.state == State::Terminated || (s.processed >= id && targets.contains(&s.state))
            })
            .await
            .map_err(|_| DatabaseError::Shutdown)?;
        Ok(reached.state)
    }

    async fn lock_available(&self) -> Result<tokio::sync::MutexGuard<'_, Ops>, DatabaseError> {
        let ops = self.shared.ops.lock().await;
        if ops.state != State::Available {
            return Err(DatabaseError::InvalidState {
                expected: State::Available,
                actual: ops.state,
            });
        }
        Ok(ops)
    }

    /// Reads a present piece.
    ///
    /// For hash-tree torrents the piece carries a proof against the view
    /// covering it, and for elastic torrents that view's signature.
    pub async fn read_piece(&self, index: u32) -> Result<Piece, DatabaseError> {
        let _ops = self.lock_available().await?;
        let descriptor = self.descriptor();
        let range = descriptor
            .piece_range(index)
            .map_err(|_| DatabaseError::InvalidPieceIndex(index))?;
        if !self.have_piece(index) {
            return Err(DatabaseError::PieceNotPresent(index));
        }

        let data = self
            .shared
            .storage
            .lock()
            .await
            .read(index)
            .await
            .map_err(|e| self.shared.fault(e))?;

        let mut piece = Piece::complete(index, data);
        if let Some(tree) = &self.shared.tree {
            let (chain, view_length) = {
                let tree = tree.lock();
                match tree.ceiling_view(range.end).map(|v| v.length()) {
                    Some(len) => (tree.hash_chain(len, index), Some(len)),
                    None => (None, None),
                }
            };
            if let Some(chain) = chain {
                piece = piece.with_hash_chain(chain);
            }
            let signature =
                view_length.and_then(|len| self.shared.signatures.lock().get(&len).copied());
            if let Some(signature) = signature {
                piece = piece.with_view_signature(signature);
            }
        }
        Ok(piece)
    }

    /// Verifies and stores a complete piece.
    ///
    /// Returns `Ok(false)`, changing nothing, if the content does not hash
    /// to what the torrent declares. For hash-tree torrents the piece must
    /// carry a proof; an elastic piece may also carry the signature of a
    /// view not yet known, which is admitted first if it verifies.
    pub async fn write_piece(&self, piece: Piece) -> Result<bool, DatabaseError> {
        let _ops = self.lock_available().await?;
        let index = piece.number();
        let descriptor = self.descriptor();
        let expected = descriptor
            .piece_length(index)
            .map_err(|_| DatabaseError::InvalidPieceIndex(index))?;
        if !piece.is_complete() {
            return Err(DatabaseError::IncompletePiece(index));
        }
        if piece.len() != expected as usize {
            return Err(DatabaseError::PieceLength {
                piece: index,
                expected,
                actual: piece.len(),
            });
        }

        let chain = piece.hash_chain().cloned();
        let signature = piece.view_signature().copied();
        let data = piece.into_content();
        let leaf = verifier::hash_off_thread(data.clone())
            .await
            .map_err(|e| self.shared.fault(e))?;

        let valid = match &self.shared.tree {
            None => self.shared.info.piece_hash(index) == Some(&leaf),
            Some(tree) => {
                if let Some(signature) = signature.filter(|_| self.shared.info.style() == Style::Elastic)
                {
                    if !self.admit_view(&signature) {
                        return Ok(false);
                    }
                }
                let piece_end = descriptor.piece_offset(index) + expected as u64;
                match chain {
                    Some(chain)
                        if chain.piece_index() == index
                            && chain.view_length() >= piece_end
                            && *chain.leaf() == leaf =>
                    {
                        let mut tree = tree.lock();
                        tree.verify_hash_chain(&chain)
                            && tree.verify_leaf_hash(chain.view_length(), index, &leaf)
                    }
                    _ => false,
                }
            }
        };
        if !valid {
            tracing::trace!(piece = index, "piece failed verification");
            return Ok(false);
        }

        self.shared
            .storage
            .lock()
            .await
            .write(index, &data)
            .await
            .map_err(|e| self.shared.fault(e))?;

        self.shared.present.set(index as usize);
        self.shared.mark_verified(index);
        tracing::trace!(piece = index, "stored piece");
        Ok(true)
    }

    /// Registers a signed view not yet known. Returns false if the signature
    /// does not verify or contradicts a known view.
    fn admit_view(&self, signature: &ViewSignature) -> bool {
        let Some(tree) = &self.shared.tree else {
            return false;
        };
        if !self.verify_view_signature(signature) {
            return false;
        }
        let added = tree
            .lock()
            .add_view(signature.view_length(), *signature.view_root_hash());
        match added {
            Ok(_) => {
                self.shared
                    .signatures
                    .lock()
                    .entry(signature.view_length())
                    .or_insert(*signature);
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "rejected view signature");
                false
            }
        }
    }

    /// Checks a view signature against the torrent's public key.
    ///
    /// The declared view is pinned by the torrent itself and always passes.
    /// Cryptographic failures are a plain `false`.
    pub fn verify_view_signature(&self, signature: &ViewSignature) -> bool {
        let info = &self.shared.info;
        if signature.view_length() == info.total_length() {
            return true;
        }
        match info.public_key() {
            Some(public_key) => verify_view(public_key, info.content_id(), signature),
            None => false,
        }
    }

    /// Grows an elastic torrent to a longer signed view.
    ///
    /// New pieces are marked verified but absent; if the old last piece was
    /// partial, it is now longer and no longer present.
    pub async fn extend(&self, signature: ViewSignature) -> Result<(), DatabaseError> {
        let _ops = self.lock_available().await?;
        self.ensure_elastic()?;
        let old = self.descriptor();
        if signature.view_length() <= old.total_length() {
            return Err(DatabaseError::ViewNotLonger {
                current: old.total_length(),
                requested: signature.view_length(),
            });
        }
        if !self.verify_view_signature(&signature) {
            return Err(DatabaseError::InvalidViewSignature);
        }
        let length = signature.view_length();
        let added = match &self.shared.tree {
            Some(tree) => tree.lock().add_view(length, *signature.view_root_hash())?,
            None => false,
        };

        let new = match self.grow(length).await {
            Ok(new) => new,
            Err(e) => {
                if let Some(tree) = self.shared.tree.as_ref().filter(|_| added) {
                    tree.lock().garbage_collect_views(|v| v.length() != length);
                }
                return Err(e);
            }
        };
        self.shared
            .signatures
            .lock()
            .insert(signature.view_length(), signature);

        let boundary = first_changed_piece(&old);
        if boundary < old.number_of_pieces() {
            self.shared.present.clear(boundary as usize);
        }
        for index in old.number_of_pieces()..new.number_of_pieces() {
            self.shared.mark_verified(index);
        }
        tracing::debug!(
            from = old.total_length(),
            to = new.total_length(),
            "extended to signed view"
        );
        Ok(())
    }

    /// Appends `data` as the origin of an elastic torrent and signs the
    /// resulting view.
    pub async fn extend_data(
        &self,
        key: &SigningKey,
        data: &[u8],
    ) -> Result<ViewSignature, DatabaseError> {
        let _ops = self.lock_available().await?;
        self.ensure_signing_key(key)?;
        let old = self.descriptor();
        if data.is_empty() {
            return Err(DatabaseError::ViewNotLonger {
                current: old.total_length(),
                requested: old.total_length(),
            });
        }

        let new = self.grow(old.total_length() + data.len() as u64).await?;
        let start = old.total_length();
        let piece = new.piece_at(start).unwrap_or(0);
        let offset = (start - new.piece_offset(piece)) as u32;
        let mut storage = self.shared.storage.lock().await;
        let written = append(&mut **storage, piece, offset, data).await;
        drop(storage);
        written.map_err(|e| self.shared.fault(e))?;

        self.seal(key, &old, &new).await
    }

    /// Like [`extend_data`](Self::extend_data) for bytes already written
    /// past the end of the storage: grows to `new_length` and signs.
    pub async fn extend_data_in_place(
        &self,
        key: &SigningKey,
        new_length: u64,
    ) -> Result<ViewSignature, DatabaseError> {
        let _ops = self.lock_available().await?;
        self.ensure_signing_key(key)?;
        let old = self.descriptor();
        if new_length <= old.total_length() {
            return Err(DatabaseError::ViewNotLonger {
                current: old.total_length(),
                requested: new_length,
            });
        }
        let new = self.grow(new_length).await?;
        self.seal(key, &old, &new).await
    }

    fn ensure_elastic(&self) -> Result<(), DatabaseError> {
        if self.shared.info.style() != Style::Elastic {
            return Err(DatabaseError::NotElastic);
        }
        Ok(())
    }

    fn ensure_signing_key(&self, key: &SigningKey) -> Result<(), DatabaseError> {
        self.ensure_elastic()?;
        if self.shared.info.public_key() != Some(&key.verifying_key()) {
            return Err(DatabaseError::WrongSigningKey);
        }
        Ok(())
    }

    /// Extends storage and bitfields to `new_length`.
    async fn grow(&self, new_length: u64) -> Result<PiecesetDescriptor, DatabaseError> {
        let new = self.descriptor().with_total_length(new_length)?;
        self.shared
            .storage
            .lock()
            .await
            .extend(new_length)
            .await
            .map_err(|e| self.shared.fault(e))?;

        *self.shared.descriptor.lock() = new;
        self.shared.present.grow(new.number_of_pieces() as usize);
        self.shared.verified.grow(new.number_of_pieces() as usize);
        Ok(new)
    }

    /// Hashes the pieces an extension touched, registers the new view,
    /// signs it and drops views nothing needs any more.
    async fn seal(
        &self,
        key: &SigningKey,
        old: &PiecesetDescriptor,
        new: &PiecesetDescriptor,
    ) -> Result<ViewSignature, DatabaseError> {
        let Some(tree) = &self.shared.tree else {
            return Err(DatabaseError::NotElastic);
        };
        let boundary = first_changed_piece(old);
        let old_length = old.total_length();

        let mut leaves = Vec::with_capacity(new.number_of_pieces() as usize);
        for index in 0..new.number_of_pieces() {
            let known = (index < boundary)
                .then(|| tree.lock().known_leaf(old_length, index))
                .flatten();
            let leaf = match known {
                Some(leaf) => leaf,
                None => {
                    let data = self
                        .shared
                        .storage
                        .lock()
                        .await
                        .read(index)
                        .await
                        .map_err(|e| self.shared.fault(e))?;
                    verifier::hash_off_thread(data)
                        .await
                        .map_err(|e| self.shared.fault(e))?
                }
            };
            leaves.push(leaf);
        }

        let new_length = new.total_length();
        let declared = self.shared.info.total_length();
        let root = tree.lock().add_view_from_leaves(new_length, &leaves)?;
        let signature = sign_view(key, self.shared.info.content_id(), new_length, root);

        for index in boundary..new.number_of_pieces() {
            self.shared.present.set(index as usize);
            self.shared.mark_verified(index);
        }

        let dropped = tree
            .lock()
            .garbage_collect_views(|v| v.length() == declared || v.length() == new_length);
        let mut signatures = self.shared.signatures.lock();
        signatures.insert(new_length, signature);
        for length in &dropped {
            signatures.remove(length);
        }
        tracing::debug!(
            from = old_length,
            to = new_length,
            dropped_views = dropped.len(),
            "extended data and signed new view"
        );
        Ok(signature)
    }
}

async fn append(
    storage: &mut dyn Storage,
    piece: u32,
    offset: u32,
    data: &[u8],
) -> Result<usize, StorageError> {
    let mut channel = storage.open_output_channel(piece, offset)?;
    let written = channel.write(data).await?;
    Ok(written)
}

/// First piece whose bytes change when data is appended after `layout`:
/// the last piece if it is partial, otherwise the first new one.
fn first_changed_piece(layout: &PiecesetDescriptor) -> u32 {
    let count = layout.number_of_pieces();
    if layout.total_length() % layout.piece_size() as u64 != 0 {
        count - 1
    } else {
        count
    }
}

impl Drop for PieceDatabase {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.lock().take() {
            if self.state() != State::Terminated {
                tracing::debug!("piece database dropped without terminate");
                self.shared.cancel_verifier_now();
            }
            driver.abort();
        }
    }
}

#[cfg(test)]
mod tests;
