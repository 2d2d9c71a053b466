use super::*;
use crate::constants::KEY_RESUME;
use crate::merkle::{hash_piece, HashTree, NodeHash};
use crate::metadata::{MemoryMetadata, MetadataError};
use crate::metainfo::ContentId;
use crate::storage::{FileEntry, FileStorage, MemoryStorage, OutputChannel};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Semaphore;

const PIECE: u32 = 1024;

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

fn content_id() -> ContentId {
    ContentId::new([5; 20])
}

fn origin_key() -> SigningKey {
    SigningKey::from_bytes(&[11u8; 32])
}

fn leaves(data: &[u8]) -> Vec<NodeHash> {
    data.chunks(PIECE as usize).map(hash_piece).collect()
}

fn full_tree(data: &[u8]) -> HashTree {
    HashTree::build_from_leaves(PIECE, data.len() as u64, &leaves(data)).unwrap()
}

fn root_of(data: &[u8]) -> NodeHash {
    full_tree(data).view(data.len() as u64).unwrap().root()
}

fn plain_info(data: &[u8]) -> Info {
    Info::plain(content_id(), PIECE, data.len() as u64, leaves(data)).unwrap()
}

fn merkle_info(data: &[u8]) -> Info {
    Info::merkle(content_id(), PIECE, data.len() as u64, root_of(data)).unwrap()
}

fn elastic_info(key: &SigningKey, data: &[u8]) -> Info {
    let root = root_of(data);
    let sig = sign_view(key, &content_id(), data.len() as u64, root);
    Info::elastic(
        content_id(),
        PIECE,
        data.len() as u64,
        root,
        *sig.signature(),
        key.verifying_key(),
    )
    .unwrap()
}

fn piece_bytes(data: &[u8], index: u32) -> Vec<u8> {
    let start = (index * PIECE) as usize;
    let end = (start + PIECE as usize).min(data.len());
    data[start..end].to_vec()
}

async fn open(info: Info, storage: impl Storage + 'static) -> PieceDatabase {
    PieceDatabase::open(info, Box::new(storage), DatabaseOptions::new())
        .await
        .unwrap()
}

async fn open_with_data(info: Info, data: &[u8]) -> PieceDatabase {
    open(info, MemoryStorage::with_data(PIECE, data.to_vec()).unwrap()).await
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

#[derive(Default)]
struct Recorder {
    events: parking_lot::Mutex<Vec<&'static str>>,
}

impl Recorder {
    fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }
}

impl DatabaseListener for Recorder {
    fn available(&self) {
        self.events.lock().push("available");
    }
    fn stopped(&self) {
        self.events.lock().push("stopped");
    }
    fn error(&self) {
        self.events.lock().push("error");
    }
    fn terminated(&self) {
        self.events.lock().push("terminated");
    }
}

#[derive(Default)]
struct Faults {
    reads: AtomicBool,
    writes: AtomicBool,
    extends: AtomicBool,
}

fn injected() -> StorageError {
    StorageError::Io(std::io::Error::other("injected fault"))
}

/// Memory storage whose reads can be held back and whose operations can be
/// made to fail.
struct TestStorage {
    inner: MemoryStorage,
    gate: Option<Arc<Semaphore>>,
    faults: Arc<Faults>,
}

impl TestStorage {
    fn new(data: &[u8]) -> Self {
        Self {
            inner: MemoryStorage::with_data(PIECE, data.to_vec()).unwrap(),
            gate: None,
            faults: Arc::default(),
        }
    }

    fn gated(data: &[u8], gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(data)
        }
    }
}

#[async_trait]
impl Storage for TestStorage {
    fn descriptor(&self) -> PiecesetDescriptor {
        self.inner.descriptor()
    }

    async fn storage_backed_pieces(&self) -> Result<Bitfield, StorageError> {
        self.inner.storage_backed_pieces().await
    }

    async fn validate(&self, cookie: Option<&[u8]>) -> Result<bool, StorageError> {
        self.inner.validate(cookie).await
    }

    async fn extend(&mut self, new_length: u64) -> Result<(), StorageError> {
        if self.faults.extends.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.extend(new_length).await
    }

    async fn close(&mut self) -> Result<Option<Bytes>, StorageError> {
        self.inner.close().await
    }

    async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes, StorageError> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
                .forget();
        }
        if self.faults.reads.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.read_at(offset, length).await
    }

    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<usize, StorageError> {
        if self.faults.writes.load(Ordering::SeqCst) {
            return Err(injected());
        }
        self.inner.write_at(offset, data).await
    }

    fn open_output_channel(
        &mut self,
        piece: u32,
        offset: u32,
    ) -> Result<OutputChannel<'_>, StorageError> {
        OutputChannel::new(self, piece, offset)
    }
}

#[tokio::test]
async fn test_missing_data_verifies_absent() {
    let temp = TempDir::new().unwrap();
    let data = sample(1536);
    let storage = FileStorage::new(
        temp.path(),
        PIECE,
        vec![FileEntry::new("a.bin", 512), FileEntry::new("b.bin", 1024)],
    )
    .unwrap();
    let recorder = Arc::new(Recorder::default());
    let db = PieceDatabase::open(
        plain_info(&data),
        Box::new(storage),
        DatabaseOptions::new().with_listener(recorder.clone()),
    )
    .await
    .unwrap();

    assert_eq!(db.state(), State::Stopped);
    assert_eq!(db.start(true).await.unwrap(), State::Available);
    assert_eq!(db.present_pieces().count(), 0);
    assert_eq!(db.verified_piece_count(), 2);
    assert!(db.verified_pieces().is_complete());
    assert_eq!(recorder.events(), vec!["available"]);
    assert!(!temp.path().join("a.bin").exists());
}

#[tokio::test]
async fn test_operations_require_available() {
    let data = sample(3000);
    let db = open_with_data(plain_info(&data), &data).await;

    assert!(matches!(
        db.read_piece(0).await,
        Err(DatabaseError::InvalidState {
            expected: State::Available,
            actual: State::Stopped
        })
    ));
    assert!(matches!(
        db.write_piece(Piece::complete(0, piece_bytes(&data, 0))).await,
        Err(DatabaseError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_plain_write_and_read() {
    let data = sample(3000);
    let db = open(plain_info(&data), MemoryStorage::new(PIECE, 3000).unwrap()).await;
    db.start(true).await.unwrap();
    assert!(!db.have_piece(1));

    let mut wrong = piece_bytes(&data, 1);
    wrong[0] ^= 0xff;
    assert!(!db.write_piece(Piece::complete(1, wrong)).await.unwrap());
    assert!(!db.have_piece(1));
    assert!(matches!(
        db.read_piece(1).await,
        Err(DatabaseError::PieceNotPresent(1))
    ));

    assert!(db
        .write_piece(Piece::complete(1, piece_bytes(&data, 1)))
        .await
        .unwrap());
    assert!(db.have_piece(1));
    let piece = db.read_piece(1).await.unwrap();
    assert_eq!(piece.content(), &data[1024..2048]);
    assert!(piece.hash_chain().is_none());
}

#[tokio::test]
async fn test_rejected_write_leaves_storage_untouched() {
    let temp = TempDir::new().unwrap();
    let data = sample(1536);
    let storage = FileStorage::new(
        temp.path(),
        PIECE,
        vec![FileEntry::new("a.bin", 512), FileEntry::new("b.bin", 1024)],
    )
    .unwrap();
    let db = open(plain_info(&data), storage).await;
    db.start(true).await.unwrap();

    let mut wrong = piece_bytes(&data, 0);
    wrong[700] ^= 1;
    assert!(!db.write_piece(Piece::complete(0, wrong)).await.unwrap());
    assert!(!temp.path().join("a.bin").exists());
    assert!(!temp.path().join("b.bin").exists());

    assert!(db
        .write_piece(Piece::complete(0, piece_bytes(&data, 0)))
        .await
        .unwrap());
    assert_eq!(std::fs::read(temp.path().join("a.bin")).unwrap(), &data[..512]);
    assert_eq!(std::fs::read(temp.path().join("b.bin")).unwrap(), &data[512..1024]);
}

#[tokio::test]
async fn test_write_rejects_unfinished_pieces() {
    let data = sample(3000);
    let db = open(plain_info(&data), MemoryStorage::new(PIECE, 3000).unwrap()).await;
    db.start(true).await.unwrap();

    assert!(matches!(
        db.write_piece(Piece::assembling(0, PIECE, 256)).await,
        Err(DatabaseError::IncompletePiece(0))
    ));
    assert!(matches!(
        db.write_piece(Piece::complete(2, vec![0u8; 10])).await,
        Err(DatabaseError::PieceLength {
            piece: 2,
            expected: 952,
            actual: 10
        })
    ));
    assert!(matches!(
        db.write_piece(Piece::complete(9, vec![0u8; 10])).await,
        Err(DatabaseError::InvalidPieceIndex(9))
    ));
}

#[tokio::test]
async fn test_present_data_verifies() {
    let data = sample(3000);
    let db = open_with_data(plain_info(&data), &data).await;
    db.start(true).await.unwrap();

    assert!(db.present_pieces().is_complete());
    assert_eq!(db.verified_piece_count(), 3);
}

#[tokio::test]
async fn test_merkle_fast_path_and_chain_transfer() {
    let data = sample(5000);
    let seeder = open_with_data(merkle_info(&data), &data).await;
    seeder.start(true).await.unwrap();
    assert!(seeder.present_pieces().is_complete());

    let leecher = open(merkle_info(&data), MemoryStorage::new(PIECE, 5000).unwrap()).await;
    leecher.start(true).await.unwrap();
    assert_eq!(leecher.present_pieces().count(), 0);

    for index in 0..5 {
        let piece = seeder.read_piece(index).await.unwrap();
        assert!(piece.hash_chain().is_some());
        let transfer = Piece::complete(index, piece.content().to_vec())
            .with_hash_chain(piece.hash_chain().unwrap().clone());
        assert!(leecher.write_piece(transfer).await.unwrap());
    }
    assert!(leecher.present_pieces().is_complete());
}

#[tokio::test]
async fn test_merkle_write_needs_matching_chain() {
    let data = sample(4096);
    let tree = full_tree(&data);
    let db = open(merkle_info(&data), MemoryStorage::new(PIECE, 4096).unwrap()).await;
    db.start(true).await.unwrap();

    // No proof at all.
    assert!(!db
        .write_piece(Piece::complete(1, piece_bytes(&data, 1)))
        .await
        .unwrap());

    // A valid proof for piece 1 does not vouch for piece 0's bytes.
    let chain = tree.hash_chain(4096, 1).unwrap();
    let swapped = Piece::complete(1, piece_bytes(&data, 0)).with_hash_chain(chain.clone());
    assert!(!db.write_piece(swapped).await.unwrap());

    // Nor does it fit another index.
    let misplaced = Piece::complete(2, piece_bytes(&data, 1)).with_hash_chain(chain.clone());
    assert!(!db.write_piece(misplaced).await.unwrap());

    let good = Piece::complete(1, piece_bytes(&data, 1)).with_hash_chain(chain);
    assert!(db.write_piece(good).await.unwrap());
    assert_eq!(db.present_pieces().ones().collect::<Vec<_>>(), vec![1]);
}

#[tokio::test]
async fn test_merkle_root_mismatch_leaves_pieces_absent() {
    let data = sample(4096);
    let mut corrupted = data.clone();
    corrupted[100] ^= 1;
    let db = open_with_data(merkle_info(&data), &corrupted).await;
    db.start(true).await.unwrap();

    // Only the root is known, so nothing can be certified piece by piece.
    assert_eq!(db.present_pieces().count(), 0);
    assert_eq!(db.verified_piece_count(), 4);
}

#[tokio::test]
async fn test_elastic_extend_marks_new_pieces_verified_absent() {
    let key = origin_key();
    let data = sample(5000);
    let db = open_with_data(elastic_info(&key, &data[..3000]), &data[..3000]).await;
    db.start(true).await.unwrap();
    assert!(db.present_pieces().is_complete());
    let before = db.verified_piece_count();

    let sig = sign_view(&key, &content_id(), 5000, root_of(&data));
    db.extend(sig).await.unwrap();

    assert_eq!(db.descriptor().number_of_pieces(), 5);
    assert_eq!(db.verified_piece_count(), before + 2);
    assert!(db.is_verified(3) && !db.have_piece(3));
    assert!(db.is_verified(4) && !db.have_piece(4));
    // The old last piece grew, so its bytes are no longer complete.
    assert!(db.is_verified(2) && !db.have_piece(2));
    assert!(db.have_piece(1));
    assert_eq!(db.latest_view_length(), Some(5000));

    let tree = full_tree(&data);
    for index in 2..5 {
        let piece = Piece::complete(index, piece_bytes(&data, index))
            .with_hash_chain(tree.hash_chain(5000, index).unwrap());
        assert!(db.write_piece(piece).await.unwrap());
    }
    assert!(db.present_pieces().is_complete());
}

#[tokio::test]
async fn test_extend_rejections() {
    let key = origin_key();
    let data = sample(5000);
    let db = open_with_data(elastic_info(&key, &data[..3000]), &data[..3000]).await;
    db.start(true).await.unwrap();

    let shorter = sign_view(&key, &content_id(), 2000, root_of(&data[..2000]));
    assert!(matches!(
        db.extend(shorter).await,
        Err(DatabaseError::ViewNotLonger {
            current: 3000,
            requested: 2000
        })
    ));

    let intruder = SigningKey::from_bytes(&[12u8; 32]);
    let forged = sign_view(&intruder, &content_id(), 5000, root_of(&data));
    assert!(!db.verify_view_signature(&forged));
    assert!(matches!(
        db.extend(forged).await,
        Err(DatabaseError::InvalidViewSignature)
    ));
    assert_eq!(db.descriptor().total_length(), 3000);

    let plain = open_with_data(plain_info(&data), &data).await;
    plain.start(true).await.unwrap();
    let sig = sign_view(&key, &content_id(), 6000, [0; 20]);
    assert!(matches!(plain.extend(sig).await, Err(DatabaseError::NotElastic)));
}

#[tokio::test]
async fn test_extend_data_signs_new_view() {
    let key = origin_key();
    let data = sample(7000);
    let origin = open_with_data(elastic_info(&key, &data[..3000]), &data[..3000]).await;
    origin.start(true).await.unwrap();

    let sig = origin.extend_data(&key, &data[3000..5000]).await.unwrap();
    assert_eq!(sig.view_length(), 5000);
    assert_eq!(*sig.view_root_hash(), root_of(&data[..5000]));
    assert!(origin.verify_view_signature(&sig));
    assert!(origin.present_pieces().is_complete());
    assert_eq!(origin.verified_piece_count(), 5);

    let last = origin.read_piece(4).await.unwrap();
    assert_eq!(last.content(), &data[4096..5000]);
    assert_eq!(last.view_signature(), Some(&sig));

    // A peer that follows the extension can take every piece from the origin.
    let peer = open(
        elastic_info(&key, &data[..3000]),
        MemoryStorage::new(PIECE, 3000).unwrap(),
    )
    .await;
    peer.start(true).await.unwrap();
    peer.extend(sig).await.unwrap();
    for index in 0..5 {
        let piece = origin.read_piece(index).await.unwrap();
        assert!(peer.write_piece(piece).await.unwrap(), "piece {index}");
    }
    assert!(peer.present_pieces().is_complete());

    // A second extension garbage collects the intermediate view.
    let next = origin.extend_data(&key, &data[5000..]).await.unwrap();
    assert_eq!(*next.view_root_hash(), root_of(&data));
    let lengths: Vec<_> = origin
        .view_signatures()
        .iter()
        .map(|s| s.view_length())
        .collect();
    assert_eq!(lengths, vec![3000, 7000]);
}

#[tokio::test]
async fn test_extend_data_requires_origin_key() {
    let key = origin_key();
    let data = sample(3000);
    let db = open_with_data(elastic_info(&key, &data), &data).await;
    db.start(true).await.unwrap();

    let other = SigningKey::from_bytes(&[13u8; 32]);
    assert!(matches!(
        db.extend_data(&other, b"more").await,
        Err(DatabaseError::WrongSigningKey)
    ));
    assert!(matches!(
        db.extend_data(&key, b"").await,
        Err(DatabaseError::ViewNotLonger { .. })
    ));
}

#[tokio::test]
async fn test_extend_data_in_place() {
    let temp = TempDir::new().unwrap();
    let key = origin_key();
    let data = sample(5000);
    std::fs::write(temp.path().join("grow.bin"), &data).unwrap();

    let storage =
        FileStorage::new(temp.path(), PIECE, vec![FileEntry::new("grow.bin", 3000)]).unwrap();
    let db = open(elastic_info(&key, &data[..3000]), storage).await;
    db.start(true).await.unwrap();
    assert_eq!(db.present_pieces().count(), 3);

    let sig = db.extend_data_in_place(&key, 5000).await.unwrap();
    assert_eq!(*sig.view_root_hash(), root_of(&data));
    assert!(db.present_pieces().is_complete());
    assert_eq!(db.read_piece(4).await.unwrap().content(), &data[4096..]);
}

#[tokio::test]
async fn test_stop_cancels_verification() {
    let data = sample(20 * PIECE as usize);
    let gate = Arc::new(Semaphore::new(0));
    let recorder = Arc::new(Recorder::default());
    let db = PieceDatabase::open(
        plain_info(&data),
        Box::new(TestStorage::gated(&data, gate.clone())),
        DatabaseOptions::new().with_listener(recorder.clone()),
    )
    .await
    .unwrap();

    db.start(false).await.unwrap();
    gate.add_permits(1);
    eventually(|| db.verified_piece_count() == 1).await;

    assert_eq!(db.state(), State::Checking);
    db.stop(false).await.unwrap();
    db.wait_for_state(&[State::Stopping]).await.unwrap();
    gate.add_permits(100);
    assert_eq!(db.wait_for_state(STOP_TARGETS).await.unwrap(), State::Stopped);

    // The piece in flight when the stop arrived is finished, nothing more.
    assert!(db.verified_piece_count() <= 2);
    assert_eq!(recorder.events(), vec!["stopped"]);

    assert_eq!(db.start(true).await.unwrap(), State::Available);
    assert_eq!(db.verified_piece_count(), 20);
}

#[tokio::test]
async fn test_terminate_while_checking() {
    let data = sample(8 * PIECE as usize);
    let gate = Arc::new(Semaphore::new(0));
    let recorder = Arc::new(Recorder::default());
    let db = PieceDatabase::open(
        plain_info(&data),
        Box::new(TestStorage::gated(&data, gate.clone())),
        DatabaseOptions::new().with_listener(recorder.clone()),
    )
    .await
    .unwrap();

    db.start(false).await.unwrap();
    db.wait_for_state(&[State::Checking]).await.unwrap();
    db.terminate(false).await.unwrap();
    gate.add_permits(100);

    assert_eq!(db.terminate(true).await.unwrap(), State::Terminated);
    assert_eq!(recorder.events(), vec!["terminated"]);

    // Everything after termination is a no-op.
    assert_eq!(db.start(true).await.unwrap(), State::Terminated);
    assert!(matches!(
        db.read_piece(0).await,
        Err(DatabaseError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_io_fault_drives_error() {
    let data = sample(3000);
    let storage = TestStorage::new(&data);
    let faults = storage.faults.clone();
    let recorder = Arc::new(Recorder::default());
    let db = PieceDatabase::open(
        plain_info(&data),
        Box::new(storage),
        DatabaseOptions::new().with_listener(recorder.clone()),
    )
    .await
    .unwrap();
    db.start(true).await.unwrap();
    assert!(db.have_piece(0));

    faults.reads.store(true, Ordering::SeqCst);
    assert!(matches!(
        db.read_piece(0).await,
        Err(DatabaseError::Storage(_))
    ));
    assert_eq!(db.wait_for_state(&[State::Error]).await.unwrap(), State::Error);
    assert_eq!(db.verified_piece_count(), 0);
    assert!(!db.have_piece(0));

    // A pass that faults lands in error again.
    assert_eq!(db.start(true).await.unwrap(), State::Error);

    faults.reads.store(false, Ordering::SeqCst);
    assert_eq!(db.start(true).await.unwrap(), State::Available);
    assert!(db.present_pieces().is_complete());
    assert_eq!(
        recorder.events(),
        vec!["available", "error", "error", "available"]
    );
}

#[tokio::test]
async fn test_fault_queued_behind_restart() {
    let data = sample(3000);
    let gate = Arc::new(Semaphore::new(3));
    let storage = TestStorage::gated(&data, gate.clone());
    let faults = storage.faults.clone();
    let db = open(plain_info(&data), storage).await;
    assert_eq!(db.start(true).await.unwrap(), State::Available);

    // The read holds the state lock while it waits at the gate, so the stop
    // and start are queued ahead of the fault it reports. The fault then
    // lands while the new pass is running.
    let (read, ()) = tokio::join!(db.read_piece(0), async {
        db.stop(false).await.unwrap();
        db.start(false).await.unwrap();
        faults.reads.store(true, Ordering::SeqCst);
        gate.add_permits(100);
    });
    assert!(matches!(read, Err(DatabaseError::Storage(_))));
    assert_eq!(db.wait_for_state(&[State::Error]).await.unwrap(), State::Error);
    assert_eq!(db.verified_piece_count(), 0);
    assert_eq!(db.present_pieces().count(), 0);

    faults.reads.store(false, Ordering::SeqCst);
    let restarted = tokio::time::timeout(Duration::from_secs(5), db.start(true))
        .await
        .expect("lifecycle calls keep answering after the fault");
    assert_eq!(restarted.unwrap(), State::Available);
    assert!(db.present_pieces().is_complete());
    assert_eq!(db.terminate(true).await.unwrap(), State::Terminated);
}

#[tokio::test]
async fn test_write_fault_drives_error() {
    let data = sample(3000);
    let storage = TestStorage::new(&[0u8; 3000]);
    let faults = storage.faults.clone();
    let db = open(plain_info(&data), storage).await;
    db.start(true).await.unwrap();
    assert_eq!(db.verified_piece_count(), 3);

    faults.writes.store(true, Ordering::SeqCst);
    assert!(matches!(
        db.write_piece(Piece::complete(1, piece_bytes(&data, 1))).await,
        Err(DatabaseError::Storage(_))
    ));
    assert_eq!(db.wait_for_state(&[State::Error]).await.unwrap(), State::Error);
    assert_eq!(db.verified_piece_count(), 0);
    assert!(!db.have_piece(1));
}

#[tokio::test]
async fn test_failed_extend_leaves_views_untouched() {
    let key = origin_key();
    let data = sample(5000);
    let storage = TestStorage::new(&data[..3000]);
    let faults = storage.faults.clone();
    let db = open(elastic_info(&key, &data[..3000]), storage).await;
    db.start(true).await.unwrap();

    let sig = sign_view(&key, &content_id(), 5000, root_of(&data));
    faults.extends.store(true, Ordering::SeqCst);
    assert!(matches!(db.extend(sig).await, Err(DatabaseError::Storage(_))));
    assert_eq!(db.latest_view_length(), Some(3000));
    assert_eq!(db.descriptor().total_length(), 3000);
    assert_eq!(db.view_signatures().len(), 1);
    assert_eq!(db.wait_for_state(&[State::Error]).await.unwrap(), State::Error);

    // With only the declared view left, the whole-tree check applies again.
    faults.extends.store(false, Ordering::SeqCst);
    assert_eq!(db.start(true).await.unwrap(), State::Available);
    assert!(db.present_pieces().is_complete());
    db.extend(sig).await.unwrap();
    assert_eq!(db.latest_view_length(), Some(5000));
}

/// Metadata whose writes of one key always fail.
struct FailingMetadata {
    inner: MemoryMetadata,
    fail_key: &'static str,
}

#[async_trait]
impl Metadata for FailingMetadata {
    async fn put(&self, key: &str, value: Option<Bytes>) -> Result<(), MetadataError> {
        if key == self.fail_key && value.is_some() {
            return Err(MetadataError::Io(std::io::Error::other("injected fault")));
        }
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, MetadataError> {
        self.inner.get(key).await
    }

    async fn close(&self) -> Result<(), MetadataError> {
        self.inner.close().await
    }
}

fn resume_files() -> Vec<FileEntry> {
    vec![FileEntry::new("one.bin", 2000), FileEntry::new("two.bin", 3000)]
}

async fn write_resume_files(temp: &TempDir, data: &[u8]) {
    tokio::fs::write(temp.path().join("one.bin"), &data[..2000])
        .await
        .unwrap();
    tokio::fs::write(temp.path().join("two.bin"), &data[2000..])
        .await
        .unwrap();
}

async fn open_session(temp: &TempDir, info: Info, meta: &MemoryMetadata) -> PieceDatabase {
    let storage = FileStorage::new(temp.path(), PIECE, resume_files()).unwrap();
    PieceDatabase::open(
        info,
        Box::new(storage),
        DatabaseOptions::new().with_metadata(meta.clone()),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_resume_skips_verification() {
    let temp = TempDir::new().unwrap();
    let data = sample(5000);
    write_resume_files(&temp, &data).await;
    let meta = MemoryMetadata::new();

    let first = open_session(&temp, plain_info(&data), &meta).await;
    first.start(true).await.unwrap();
    first.terminate(true).await.unwrap();
    assert_eq!(meta.keys(), vec!["resume".to_string()]);

    let second = open_session(&temp, plain_info(&data), &meta).await;
    assert_eq!(second.verified_piece_count(), 5);
    assert!(second.present_pieces().is_complete());
    // The record is single use.
    assert!(meta.keys().is_empty());

    assert_eq!(second.start(true).await.unwrap(), State::Available);
    assert_eq!(second.read_piece(4).await.unwrap().content(), &data[4096..]);
}

#[tokio::test]
async fn test_resume_rejected_after_tampering() {
    let temp = TempDir::new().unwrap();
    let data = sample(5000);
    write_resume_files(&temp, &data).await;
    let meta = MemoryMetadata::new();

    let first = open_session(&temp, plain_info(&data), &meta).await;
    first.start(true).await.unwrap();
    first.terminate(true).await.unwrap();

    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(temp.path().join("two.bin"))
        .unwrap();
    file.set_len(1500).unwrap();

    let second = open_session(&temp, plain_info(&data), &meta).await;
    assert_eq!(second.verified_piece_count(), 0);

    second.start(true).await.unwrap();
    assert!(second.have_piece(0) && second.have_piece(2));
    assert!(!second.have_piece(3) && !second.have_piece(4));
}

#[tokio::test]
async fn test_nothing_persisted_unless_fully_verified() {
    let temp = TempDir::new().unwrap();
    let data = sample(5000);
    let meta = MemoryMetadata::new();

    let db = open_session(&temp, plain_info(&data), &meta).await;
    db.terminate(true).await.unwrap();
    assert!(meta.keys().is_empty());
}

#[tokio::test]
async fn test_merkle_tree_survives_sessions() {
    let temp = TempDir::new().unwrap();
    let data = sample(5000);
    write_resume_files(&temp, &data).await;
    let meta = MemoryMetadata::new();

    let first = open_session(&temp, merkle_info(&data), &meta).await;
    first.start(true).await.unwrap();
    assert!(first.present_pieces().is_complete());
    first.terminate(true).await.unwrap();
    assert_eq!(
        meta.keys(),
        vec!["elasticImmutable", "elasticView", "resume"]
    );

    // Corrupt piece 1 on disk and forget the present bitmap.
    let mut corrupted = data.clone();
    corrupted[1500] ^= 0xff;
    write_resume_files(&temp, &corrupted).await;
    meta.put(KEY_RESUME, None).await.unwrap();

    let second = open_session(&temp, merkle_info(&data), &meta).await;
    second.start(true).await.unwrap();
    // The whole-tree check fails, but the restored nodes still certify
    // every intact piece.
    let present: Vec<_> = second.present_pieces().ones().collect();
    assert_eq!(present, vec![0, 2, 3, 4]);
}

#[tokio::test]
async fn test_elastic_views_survive_sessions() {
    let temp = TempDir::new().unwrap();
    let key = origin_key();
    let data = sample(5000);
    write_resume_files(&temp, &data).await;
    let meta = MemoryMetadata::new();

    let storage = FileStorage::new(
        temp.path(),
        PIECE,
        vec![FileEntry::new("one.bin", 2000), FileEntry::new("two.bin", 1000)],
    )
    .unwrap();
    let first = PieceDatabase::open(
        elastic_info(&key, &data[..3000]),
        Box::new(storage),
        DatabaseOptions::new().with_metadata(meta.clone()),
    )
    .await
    .unwrap();
    first.start(true).await.unwrap();
    let sig = first.extend_data_in_place(&key, 5000).await.unwrap();
    first.terminate(true).await.unwrap();
    assert_eq!(
        meta.keys(),
        vec![
            "elasticImmutable",
            "elasticViewSignatures",
            "elasticViews",
            "resume"
        ]
    );

    let storage = FileStorage::new(
        temp.path(),
        PIECE,
        vec![FileEntry::new("one.bin", 2000), FileEntry::new("two.bin", 1000)],
    )
    .unwrap();
    let second = PieceDatabase::open(
        elastic_info(&key, &data[..3000]),
        Box::new(storage),
        DatabaseOptions::new().with_metadata(meta.clone()),
    )
    .await
    .unwrap();

    assert_eq!(second.descriptor().total_length(), 5000);
    assert_eq!(second.latest_view_length(), Some(5000));
    assert!(second.view_signatures().contains(&sig));
    assert!(second.present_pieces().is_complete());
}

#[tokio::test]
async fn test_failed_persist_starts_next_session_unverified() {
    let temp = TempDir::new().unwrap();
    let data = sample(5000);
    write_resume_files(&temp, &data).await;
    let meta = MemoryMetadata::new();

    let storage = FileStorage::new(temp.path(), PIECE, resume_files()).unwrap();
    let first = PieceDatabase::open(
        merkle_info(&data),
        Box::new(storage),
        DatabaseOptions::new().with_metadata(FailingMetadata {
            inner: meta.clone(),
            fail_key: KEY_RESUME,
        }),
    )
    .await
    .unwrap();
    first.start(true).await.unwrap();
    assert!(first.present_pieces().is_complete());
    assert_eq!(first.terminate(true).await.unwrap(), State::Terminated);
    assert_eq!(meta.keys(), vec!["elasticImmutable", "elasticView"]);

    let second = open_session(&temp, merkle_info(&data), &meta).await;
    assert_eq!(second.verified_piece_count(), 0);
    assert_eq!(second.start(true).await.unwrap(), State::Available);
    assert!(second.present_pieces().is_complete());
}
