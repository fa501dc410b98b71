//! Block space metadata catalog.
//!
//! Layout (big-endian):
//!
//! ```text
//! +-----------+-------------+---------+-------------+
//! | blockSize | initialSize | extSize | consistency |   4 x u32
//! +-----------+-------------+---------+-------------+
//! | global bitmap                                   |
//! +-----------+-----------+------------+------------+
//! | freeCount | usedCount | nextUnitId | unitCount  |   4 x u32
//! +-----------+-----------+------------+------------+
//! | unitId | unit bitmap | ... (unitCount times)    |
//! +-------------------------------------------------+
//! ```
//!
//! The consistency word sits at a fixed offset so it can be flipped on its own.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut};

use bracket_common::types::UnitId;

use super::bitmap::Bitmap;
use super::error::{StoreError, StoreResult};

/// Byte offset of the consistency word.
pub const CONSISTENCY_OFFSET: u64 = 12;

/// Consistency word of a cleanly closed catalog.
pub const CONSISTENT: u32 = 0;

/// Consistency word while the space is open.
pub const INCONSISTENT: u32 = 1;

/// In-memory image of the metadata file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceMeta {
    /// Block size in bytes.
    pub block_size: u32,
    /// Blocks the space was created with.
    pub initial_blocks: u32,
    /// Blocks added per extension.
    pub ext_blocks: u32,
    /// True if the catalog was cleanly closed.
    pub consistent: bool,
    /// Global used/free table.
    pub bitmap: Bitmap,
    /// Free block counter.
    pub free_blocks: u32,
    /// Used block counter.
    pub used_blocks: u32,
    /// Next automatically assigned unit id.
    pub next_unit_id: u32,
    /// Per-unit block tables.
    pub units: BTreeMap<UnitId, Bitmap>,
}

impl SpaceMeta {
    /// Encodes the catalog.
    pub fn encode(&self) -> Vec<u8> {
        let units_len: usize = self.units.values().map(|b| 4 + b.encoded_len()).sum();
        let mut buf = Vec::with_capacity(32 + self.bitmap.encoded_len() + units_len);

        buf.put_u32(self.block_size);
        buf.put_u32(self.initial_blocks);
        buf.put_u32(self.ext_blocks);
        buf.put_u32(if self.consistent {
            CONSISTENT
        } else {
            INCONSISTENT
        });
        self.bitmap.encode(&mut buf);
        buf.put_u32(self.free_blocks);
        buf.put_u32(self.used_blocks);
        buf.put_u32(self.next_unit_id);
        buf.put_u32(self.units.len() as u32);
        for (unit, bitmap) in &self.units {
            buf.put_u32(unit.as_u32());
            bitmap.encode(&mut buf);
        }
        buf
    }

    /// Decodes the catalog.
    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        let mut buf = bytes;
        let header = |buf: &[u8], needed: usize, what: &str| -> StoreResult<()> {
            if buf.remaining() < needed {
                return Err(StoreError::corrupt(format!("truncated {what}")));
            }
            Ok(())
        };

        header(buf, 16, "header")?;
        let block_size = buf.get_u32();
        let initial_blocks = buf.get_u32();
        let ext_blocks = buf.get_u32();
        let consistent = buf.get_u32() == CONSISTENT;
        let bitmap = Bitmap::decode(&mut buf)?;

        header(buf, 16, "counters")?;
        let free_blocks = buf.get_u32();
        let used_blocks = buf.get_u32();
        let next_unit_id = buf.get_u32();
        let unit_count = buf.get_u32();

        let mut units = BTreeMap::new();
        for _ in 0..unit_count {
            header(buf, 4, "unit id")?;
            let unit = UnitId::new(buf.get_u32());
            units.insert(unit, Bitmap::decode(&mut buf)?);
        }

        Ok(Self {
            block_size,
            initial_blocks,
            ext_blocks,
            consistent,
            bitmap,
            free_blocks,
            used_blocks,
            next_unit_id,
            units,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SpaceMeta {
        let mut bitmap = Bitmap::new(16);
        bitmap.set(0);
        bitmap.set(5);
        let mut unit = Bitmap::new(16);
        unit.set(5);

        let mut units = BTreeMap::new();
        units.insert(UnitId::new(1), unit);
        SpaceMeta {
            block_size: 512,
            initial_blocks: 16,
            ext_blocks: 8,
            consistent: true,
            bitmap,
            free_blocks: 14,
            used_blocks: 1,
            next_unit_id: 2,
            units,
        }
    }

    #[test]
    fn test_round_trip() {
        let meta = sample();
        let bytes = meta.encode();
        assert_eq!(SpaceMeta::decode(&bytes).unwrap(), meta);
    }

    #[test]
    fn test_consistency_word_offset() {
        let mut meta = sample();
        meta.consistent = false;
        let bytes = meta.encode();
        let at = CONSISTENCY_OFFSET as usize;
        assert_eq!(&bytes[at..at + 4], &INCONSISTENT.to_be_bytes());
    }

    #[test]
    fn test_truncated_catalog() {
        let bytes = sample().encode();
        assert!(SpaceMeta::decode(&bytes[..bytes.len() - 3]).is_err());
        assert!(SpaceMeta::decode(&bytes[..8]).is_err());
    }
}
