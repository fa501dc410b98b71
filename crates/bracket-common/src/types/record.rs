//! Document node records and page kinds, shared by tree pages and log operations.

use bytes::Bytes;
use std::fmt;

use super::dewey::DeweyId;
use super::ids::PageId;

/// One node record: its key and its value bytes.
///
/// When `external` is set, `value` holds the 8-byte [`PageId`] of the blob
/// page chain that stores the real value.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NodeRecord {
    /// Node key.
    pub key: DeweyId,
    /// In-page value bytes.
    pub value: Bytes,
    /// Value lives in a blob chain.
    pub external: bool,
}

impl NodeRecord {
    /// Creates an inline record.
    #[must_use]
    pub fn new(key: DeweyId, value: impl Into<Bytes>) -> Self {
        Self {
            key,
            value: value.into(),
            external: false,
        }
    }

    /// Creates a record that references a blob chain.
    #[must_use]
    pub fn external(key: DeweyId, blob: PageId) -> Self {
        Self {
            key,
            value: Bytes::copy_from_slice(&blob.to_be_bytes()),
            external: true,
        }
    }

    /// Returns the referenced blob page, if this record is externalized.
    #[must_use]
    pub fn blob_page(&self) -> Option<PageId> {
        if self.external {
            PageId::read_from(&self.value)
        } else {
            None
        }
    }

    /// Size of the record when laid out in a page or log payload.
    ///
    /// key + flag byte + value length (u32) + value.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.key.encoded_len() + 1 + 4 + self.value.len()
    }
}

impl fmt::Debug for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.blob_page() {
            Some(page) => write!(f, "{} -> blob {}", self.key, page),
            None => write!(f, "{} ({} bytes)", self.key, self.value.len()),
        }
    }
}

/// The two shapes a tree page can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageKind {
    /// Separator keys and child pointers.
    Branch = 0,
    /// Document records.
    Leaf = 1,
}

impl PageKind {
    /// Converts the kind to its on-page flag byte.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parses an on-page flag byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Branch),
            1 => Some(Self::Leaf),
            _ => None,
        }
    }
}

impl fmt::Display for PageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Branch => f.write_str("branch"),
            Self::Leaf => f.write_str("leaf"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_record() {
        let key: DeweyId = "1.3".parse().unwrap();
        let record = NodeRecord::external(key.clone(), PageId::new(2, 17));
        assert_eq!(record.blob_page(), Some(PageId::new(2, 17)));
        assert_eq!(record.encoded_len(), key.encoded_len() + 5 + 8);

        let inline = NodeRecord::new(key, &b"abc"[..]);
        assert_eq!(inline.blob_page(), None);
        assert_eq!(format!("{inline:?}"), "1.3 (3 bytes)");
    }

    #[test]
    fn test_page_kind_flag() {
        assert_eq!(PageKind::from_u8(PageKind::Leaf.as_u8()), Some(PageKind::Leaf));
        assert_eq!(PageKind::from_u8(0), Some(PageKind::Branch));
        assert_eq!(PageKind::from_u8(7), None);
    }
}
