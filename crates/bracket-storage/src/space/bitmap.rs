//! Growable bit vector used for the global and per-unit block tables.

use bytes::{Buf, BufMut};

use super::error::{StoreError, StoreResult};

/// A fixed-length bit vector that can only grow.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// Creates a bitmap of `len` clear bits.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    /// Logical number of bits.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the bitmap has no bits.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns bit `i`. Bits past the end read as clear.
    #[inline]
    pub fn get(&self, i: usize) -> bool {
        i < self.len && self.words[i / 64] & (1 << (i % 64)) != 0
    }

    /// Sets bit `i`. `i` must be below `len()`.
    #[inline]
    pub fn set(&mut self, i: usize) {
        debug_assert!(i < self.len, "bit {i} out of range {}", self.len);
        self.words[i / 64] |= 1 << (i % 64);
    }

    /// Clears bit `i`. Out of range bits are ignored.
    #[inline]
    pub fn clear(&mut self, i: usize) {
        if i < self.len {
            self.words[i / 64] &= !(1 << (i % 64));
        }
    }

    /// Grows the bitmap to `len` bits. Never shrinks.
    pub fn extend_to(&mut self, len: usize) {
        if len > self.len {
            self.words.resize(len.div_ceil(64), 0);
            self.len = len;
        }
    }

    /// Index of the first clear bit at or after `from`.
    pub fn next_clear(&self, from: usize) -> Option<usize> {
        (from..self.len).find(|&i| !self.get(i))
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterates over the indexes of set bits.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&i| self.get(i))
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        4 + 4 + self.words.len() * 8
    }

    /// Encodes as `len (u32) word_count (u32) words (u64)*`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.len as u32);
        buf.put_u32(self.words.len() as u32);
        for word in &self.words {
            buf.put_u64(*word);
        }
    }

    /// Decodes a bitmap written by [`Bitmap::encode`].
    pub fn decode(buf: &mut impl Buf) -> StoreResult<Self> {
        if buf.remaining() < 8 {
            return Err(StoreError::corrupt("truncated bitmap header"));
        }
        let len = buf.get_u32() as usize;
        let count = buf.get_u32() as usize;
        if count != len.div_ceil(64) || buf.remaining() < count * 8 {
            return Err(StoreError::corrupt(format!(
                "bitmap of {len} bits with {count} words"
            )));
        }
        let words = (0..count).map(|_| buf.get_u64()).collect();
        Ok(Self { words, len })
    }
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("len", &self.len)
            .field("ones", &self.count_ones())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear() {
        let mut bits = Bitmap::new(130);
        bits.set(0);
        bits.set(64);
        bits.set(129);
        assert!(bits.get(64));
        assert_eq!(bits.count_ones(), 3);
        bits.clear(64);
        assert!(!bits.get(64));
        assert!(!bits.get(500));
        assert_eq!(bits.iter_ones().collect::<Vec<_>>(), vec![0, 129]);
    }

    #[test]
    fn test_next_clear() {
        let mut bits = Bitmap::new(4);
        bits.set(0);
        bits.set(1);
        assert_eq!(bits.next_clear(0), Some(2));
        bits.set(2);
        bits.set(3);
        assert_eq!(bits.next_clear(0), None);
        assert_eq!(bits.next_clear(10), None);
    }

    #[test]
    fn test_extend_is_monotonic() {
        let mut bits = Bitmap::new(16);
        bits.set(15);
        bits.extend_to(24);
        assert_eq!(bits.len(), 24);
        assert!(bits.get(15));
        assert_eq!(bits.next_clear(16), Some(16));

        bits.extend_to(8);
        assert_eq!(bits.len(), 24);
    }

    #[test]
    fn test_encoding() {
        let mut bits = Bitmap::new(70);
        bits.set(3);
        bits.set(69);
        let mut buf = Vec::new();
        bits.encode(&mut buf);
        assert_eq!(buf.len(), bits.encoded_len());

        let decoded = Bitmap::decode(&mut &buf[..]).unwrap();
        assert_eq!(decoded, bits);
        assert!(Bitmap::decode(&mut &buf[..10]).is_err());
    }
}
