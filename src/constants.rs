//! Storage constants and tuning parameters.
//!
//! Everything here is a default; the types that consume these values expose
//! `with_*` builders where a caller may want something else.

use std::time::Duration;

// ============================================================================
// Pieces and blocks
// ============================================================================

/// Default sub-piece block size used when assembling pieces (16 KiB).
pub const DEFAULT_BLOCK_SIZE: u32 = 16384;

/// Length of a SHA1 digest, used for leaf hashes, tree nodes and content ids.
pub const HASH_LEN: usize = 20;

// ============================================================================
// Storage
// ============================================================================

/// Largest total length a [`MemoryStorage`](crate::storage::MemoryStorage)
/// will allocate.
pub const MAX_MEMORY_STORAGE_LENGTH: u64 = isize::MAX as u64;

/// Idle time after which a cached file handle is closed by
/// [`FileStorage::evict_idle_handles`](crate::storage::FileStorage::evict_idle_handles).
pub const FILE_HANDLE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Header of every storage cookie.
pub const COOKIE_MAGIC: &[u8; 4] = b"PDBC";

/// Cookie layout version; bump when the per-file record changes.
pub const COOKIE_VERSION: u8 = 1;

// ============================================================================
// Metadata keys
// ============================================================================

/// Storage cookie plus present-piece bitmap.
pub const KEY_RESUME: &str = "resume";

/// Hash-tree nodes shared by every view.
pub const KEY_ELASTIC_IMMUTABLE: &str = "elasticImmutable";

/// The single mutable view of a merkle torrent.
pub const KEY_ELASTIC_VIEW: &str = "elasticView";

/// Every mutable view of an elastic torrent.
pub const KEY_ELASTIC_VIEWS: &str = "elasticViews";

/// Signatures for the views in [`KEY_ELASTIC_VIEWS`].
pub const KEY_ELASTIC_VIEW_SIGNATURES: &str = "elasticViewSignatures";

// ============================================================================
// Signatures
// ============================================================================

/// Length of the token signed for each elastic view:
/// content id (20) + view length (8) + root hash (20).
pub const SIGNING_TOKEN_LEN: usize = 48;
