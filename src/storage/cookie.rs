//! Storage cookies: fingerprints of the backing files at close time.

use std::path::Path;
use std::time::UNIX_EPOCH;

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::{COOKIE_MAGIC, COOKIE_VERSION};

/// What the filesystem says about one backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct FileStamp {
    pub(crate) present: bool,
    pub(crate) mtime_secs: u64,
    pub(crate) mtime_nanos: u32,
    pub(crate) length: u64,
}

impl FileStamp {
    pub(crate) async fn of(path: &Path) -> std::io::Result<Self> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e),
        };
        let mtime = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Ok(Self {
            present: true,
            mtime_secs: mtime.as_secs(),
            mtime_nanos: mtime.subsec_nanos(),
            length: metadata.len(),
        })
    }
}

/// `magic ‖ version ‖ file count (u32)` then per file
/// `present (u8) ‖ mtime secs (u64) ‖ mtime nanos (u32) ‖ length (u64)`.
pub(crate) fn encode(stamps: &[FileStamp]) -> Bytes {
    let mut out = BytesMut::with_capacity(COOKIE_MAGIC.len() + 5 + stamps.len() * 21);
    out.put_slice(COOKIE_MAGIC);
    out.put_u8(COOKIE_VERSION);
    out.put_u32(stamps.len() as u32);
    for stamp in stamps {
        out.put_u8(stamp.present as u8);
        out.put_u64(stamp.mtime_secs);
        out.put_u32(stamp.mtime_nanos);
        out.put_u64(stamp.length);
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let stamps = [
            FileStamp {
                present: true,
                mtime_secs: 7,
                mtime_nanos: 9,
                length: 512,
            },
            FileStamp::default(),
        ];
        let cookie = encode(&stamps);
        assert_eq!(&cookie[..4], COOKIE_MAGIC);
        assert_eq!(cookie[4], COOKIE_VERSION);
        assert_eq!(&cookie[5..9], &2u32.to_be_bytes());
        assert_eq!(cookie.len(), 9 + 2 * 21);
        assert_eq!(cookie[9], 1);
        assert_eq!(cookie[9 + 21], 0);
    }

    #[test]
    fn test_different_lengths_differ() {
        let a = FileStamp {
            present: true,
            length: 10,
            ..Default::default()
        };
        let b = FileStamp { length: 11, ..a };
        assert_ne!(encode(&[a]), encode(&[b]));
    }

    #[tokio::test]
    async fn test_stamp_of_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let stamp = FileStamp::of(&dir.path().join("nope")).await.unwrap();
        assert_eq!(stamp, FileStamp::default());
    }
}
