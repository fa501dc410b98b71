//! Core identifier types for BracketDB.
//!
//! These types provide type-safe wrappers around numeric identifiers,
//! preventing accidental misuse of different ID types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Container identifier - names one block address space (data file + metadata file).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ContainerId(u32);

impl ContainerId {
    /// Creates a new `ContainerId` from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContainerId({})", self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ContainerId {
    #[inline]
    fn from(id: u32) -> Self {
        Self::new(id)
    }
}

/// Unit identifier - names a group of blocks inside a container that is
/// reclaimed together.
///
/// Unit ids are positive; `UnitId::NONE` (0) is never assigned.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct UnitId(u32);

impl UnitId {
    /// Sentinel for "no unit".
    pub const NONE: Self = Self(0);

    /// Smallest id the allocator hands out.
    pub const FIRST: Self = Self(1);

    /// Creates a new `UnitId` from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Checks if this is a real unit id.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::NONE.0
    }
}

impl fmt::Debug for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NONE {
            write!(f, "UnitId(NONE)")
        } else {
            write!(f, "UnitId({})", self.0)
        }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for UnitId {
    #[inline]
    fn from(id: u32) -> Self {
        Self::new(id)
    }
}

/// Page identifier - a (container, block) pair.
///
/// Block 0 of every container is reserved, so `(0, 0)` doubles as the
/// serializable `NO_PAGE` sentinel and a zero-filled pointer field reads
/// back as "no page".
///
/// # Example
///
/// ```rust
/// use bracket_common::types::PageId;
///
/// let page = PageId::new(1, 42);
/// assert_eq!(page.block(), 42);
/// assert_eq!(PageId::from_be_bytes(page.to_be_bytes()), page);
/// assert!(!PageId::NO_PAGE.is_valid());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId {
    container: u32,
    block: u32,
}

impl PageId {
    /// Serialized size in bytes.
    pub const SIZE: usize = 8;

    /// The "no page" sentinel.
    pub const NO_PAGE: Self = Self {
        container: 0,
        block: 0,
    };

    /// Creates a new `PageId`.
    #[inline]
    #[must_use]
    pub const fn new(container: u32, block: u32) -> Self {
        Self { container, block }
    }

    /// Returns the container number.
    #[inline]
    #[must_use]
    pub const fn container(self) -> u32 {
        self.container
    }

    /// Returns the container as a typed id.
    #[inline]
    #[must_use]
    pub const fn container_id(self) -> ContainerId {
        ContainerId::new(self.container)
    }

    /// Returns the block number (logical block address).
    #[inline]
    #[must_use]
    pub const fn block(self) -> u32 {
        self.block
    }

    /// Checks if this id addresses a real page.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.block != 0
    }

    /// Creates a PageId from bytes (big-endian).
    #[inline]
    #[must_use]
    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self {
            container: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            block: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Converts to bytes (big-endian).
    #[inline]
    #[must_use]
    pub fn to_be_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.container.to_be_bytes());
        out[4..].copy_from_slice(&self.block.to_be_bytes());
        out
    }

    /// Encodes an optional pointer, mapping `None` to `NO_PAGE`.
    #[inline]
    #[must_use]
    pub fn encode_opt(page: Option<PageId>) -> [u8; 8] {
        page.unwrap_or(Self::NO_PAGE).to_be_bytes()
    }

    /// Decodes an optional pointer, mapping `NO_PAGE` to `None`.
    #[inline]
    #[must_use]
    pub fn decode_opt(bytes: [u8; 8]) -> Option<PageId> {
        Some(Self::from_be_bytes(bytes)).filter(|p| p.is_valid())
    }

    /// Reads a PageId from the first 8 bytes of `buf`.
    ///
    /// Returns `None` if the slice is too short.
    #[must_use]
    pub fn read_from(buf: &[u8]) -> Option<Self> {
        let bytes: [u8; 8] = buf.get(..Self::SIZE)?.try_into().ok()?;
        Some(Self::from_be_bytes(bytes))
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NO_PAGE {
            write!(f, "PageId(NO_PAGE)")
        } else {
            write!(f, "PageId({}:{})", self.container, self.block)
        }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.container, self.block)
    }
}

/// Transaction identifier - uniquely identifies a transaction.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TxnId(u64);

impl TxnId {
    /// Invalid transaction ID, used as a sentinel value.
    pub const INVALID: Self = Self(0);

    /// Minimum valid transaction ID.
    pub const MIN: Self = Self(1);

    /// Creates a new `TxnId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next transaction ID.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Checks if this is a valid transaction ID.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "TxnId(INVALID)")
        } else {
            write!(f, "TxnId({})", self.0)
        }
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TxnId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

/// Log Sequence Number - identifies a position in the write-ahead log.
///
/// LSNs are monotonically increasing. Every page carries the LSN of the last
/// logged change applied to it, which makes redo idempotent.
///
/// # Example
///
/// ```rust
/// use bracket_common::types::Lsn;
///
/// let lsn = Lsn::new(1000);
/// assert!(lsn > Lsn::INVALID);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Lsn(u64);

impl Lsn {
    /// Invalid LSN, used as a sentinel value (also "never logged").
    pub const INVALID: Self = Self(0);

    /// First valid LSN.
    pub const FIRST: Self = Self(1);

    /// Creates a new `Lsn` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next LSN.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Checks if this is a valid LSN.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "Lsn(INVALID)")
        } else {
            write!(f, "Lsn({})", self.0)
        }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Lsn {
    #[inline]
    fn from(lsn: u64) -> Self {
        Self::new(lsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_id_bytes() {
        let page = PageId::new(3, 0x0102_0304);
        let bytes = page.to_be_bytes();
        assert_eq!(bytes, [0, 0, 0, 3, 1, 2, 3, 4]);
        assert_eq!(PageId::from_be_bytes(bytes), page);
        assert_eq!(PageId::read_from(&bytes[..]), Some(page));
        assert_eq!(PageId::read_from(&bytes[..7]), None);
    }

    #[test]
    fn test_no_page_sentinel() {
        assert!(!PageId::NO_PAGE.is_valid());
        assert!(!PageId::new(7, 0).is_valid());
        assert_eq!(PageId::encode_opt(None), [0u8; 8]);
        assert_eq!(PageId::decode_opt([0u8; 8]), None);

        let page = PageId::new(1, 9);
        assert_eq!(PageId::decode_opt(PageId::encode_opt(Some(page))), Some(page));
        assert_eq!(format!("{:?}", PageId::NO_PAGE), "PageId(NO_PAGE)");
        assert_eq!(page.to_string(), "1:9");
    }

    #[test]
    fn test_lsn_ordering() {
        assert!(Lsn::INVALID < Lsn::FIRST);
        assert_eq!(Lsn::new(41).next(), Lsn::new(42));
        assert!(!Lsn::INVALID.is_valid());
    }

    #[test]
    fn test_unit_id() {
        assert!(!UnitId::NONE.is_valid());
        assert!(UnitId::FIRST.is_valid());
        assert_eq!(format!("{:?}", UnitId::NONE), "UnitId(NONE)");
        assert_eq!(UnitId::from(5).as_u32(), 5);
    }

    #[test]
    fn test_txn_id() {
        assert!(!TxnId::INVALID.is_valid());
        assert_eq!(TxnId::MIN.next(), TxnId::new(2));
    }
}
