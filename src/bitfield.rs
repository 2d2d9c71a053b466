//! Piece bitfields.
//!
//! [`Bitfield`] is a plain MSB-first bitset, one bit per piece, in the same
//! layout the wire protocol uses. [`SharedBitfield`] wraps one behind its own
//! lock so the background verifier and the database's public operations can
//! both touch it without holding the database's state lock.

use bytes::Bytes;
use parking_lot::Mutex;

/// A bitset with one bit per piece.
///
/// Bits are numbered from the high bit of the first byte. Spare bits in the
/// last byte are always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates an all-clear bitfield for `piece_count` pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Creates an all-set bitfield for `piece_count` pieces.
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Creates a bitfield from packed bytes, padding or truncating to fit.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Self {
        let mut bits = bytes.to_vec();
        bits.resize(piece_count.div_ceil(8), 0);
        let mut bf = Self { bits, piece_count };
        bf.clear_spare_bits();
        bf
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    pub fn set(&mut self, index: usize) {
        if index >= self.piece_count {
            return;
        }
        self.bits[index / 8] |= 1 << (7 - index % 8);
    }

    pub fn clear(&mut self, index: usize) {
        if index >= self.piece_count {
            return;
        }
        self.bits[index / 8] &= !(1 << (7 - index % 8));
    }

    /// Clears every bit.
    pub fn clear_all(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
    }

    /// Grows the bitfield to `piece_count` pieces; new bits are clear.
    ///
    /// Shrinking is a no-op.
    pub fn grow(&mut self, piece_count: usize) {
        if piece_count <= self.piece_count {
            return;
        }
        self.bits.resize(piece_count.div_ceil(8), 0);
        self.piece_count = piece_count;
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Number of pieces this bitfield describes.
    pub fn len(&self) -> usize {
        self.piece_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Indices of every set bit.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(|&i| self.has(i))
    }

    /// Indices of every clear bit.
    pub fn zeros(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.piece_count).filter(|&i| !self.has(i))
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() * 8 - self.piece_count;
        if spare > 0 && spare < 8 {
            let last = self.bits.len() - 1;
            self.bits[last] &= 0xFFu8 << spare;
        }
    }
}

/// A [`Bitfield`] guarded by its own lock.
///
/// The lock is independent of any other lock in the database and is only
/// ever held for a single bit operation or a snapshot, never across I/O.
#[derive(Debug)]
pub struct SharedBitfield {
    inner: Mutex<Bitfield>,
}

impl SharedBitfield {
    pub fn new(piece_count: usize) -> Self {
        Self {
            inner: Mutex::new(Bitfield::new(piece_count)),
        }
    }

    pub fn has(&self, index: usize) -> bool {
        self.inner.lock().has(index)
    }

    /// Sets bit `index`, returning whether it was previously clear.
    pub fn set(&self, index: usize) -> bool {
        let mut bf = self.inner.lock();
        let was_clear = index < bf.len() && !bf.has(index);
        bf.set(index);
        was_clear
    }

    pub fn clear(&self, index: usize) {
        self.inner.lock().clear(index);
    }

    pub fn clear_all(&self) {
        self.inner.lock().clear_all();
    }

    pub fn grow(&self, piece_count: usize) {
        self.inner.lock().grow(piece_count);
    }

    pub fn count(&self) -> usize {
        self.inner.lock().count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Copies the current contents.
    pub fn snapshot(&self) -> Bitfield {
        self.inner.lock().clone()
    }

    /// Replaces the contents wholesale.
    pub fn replace(&self, bitfield: Bitfield) {
        *self.inner.lock() = bitfield;
    }
}
