//! Hierarchical document keys.
//!
//! A [`DeweyId`] is a sequence of small non-negative integers ("divisions")
//! encoding a node's position in a document tree. The first division names
//! the document, every further division selects a child of the node named by
//! the prefix:
//!
//! ```text
//!   [1]                 document root
//!   ├── [1,0,1]         attribute of [1]  (marker division 0)
//!   ├── [1,1]           first child
//!   │    └── [1,1,1]
//!   └── [1,2]           second child
//! ```
//!
//! Keys compare by the lexicographic order of their divisions, which is the
//! pre-order (document order) of the tree. A subtree therefore occupies the
//! contiguous range `[key, key.subtree_bound())`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Division value that marks the following division as an attribute.
pub const ATTRIBUTE_DIVISION: u32 = 0;

/// Maximum number of divisions a key may carry.
pub const MAX_DIVISIONS: usize = u16::MAX as usize;

/// Errors raised while building or decoding a [`DeweyId`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeweyIdError {
    /// A key needs at least one division.
    #[error("DeweyID must have at least one division")]
    Empty,

    /// Too many divisions for the wire format.
    #[error("DeweyID has {0} divisions (max: {MAX_DIVISIONS})")]
    TooLong(usize),

    /// Encoded bytes ended early.
    #[error("truncated DeweyID: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },

    /// Text form could not be parsed.
    #[error("invalid DeweyID text: {0:?}")]
    Parse(String),
}

/// A hierarchical, totally ordered document key.
///
/// # Example
///
/// ```rust
/// use bracket_common::types::DeweyId;
///
/// let parent: DeweyId = "1.2".parse().unwrap();
/// let child = parent.child(1);
/// assert_eq!(child.to_string(), "1.2.1");
/// assert_eq!(child.parent(), Some(parent.clone()));
/// assert!(parent < child && child < parent.subtree_bound());
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u32>", into = "Vec<u32>")]
pub struct DeweyId {
    divisions: Vec<u32>,
}

impl TryFrom<Vec<u32>> for DeweyId {
    type Error = DeweyIdError;

    fn try_from(divisions: Vec<u32>) -> Result<Self, Self::Error> {
        Self::new(divisions)
    }
}

impl From<DeweyId> for Vec<u32> {
    fn from(key: DeweyId) -> Self {
        key.divisions
    }
}

impl DeweyId {
    /// Creates a key from its divisions.
    pub fn new(divisions: Vec<u32>) -> Result<Self, DeweyIdError> {
        if divisions.is_empty() {
            return Err(DeweyIdError::Empty);
        }
        if divisions.len() > MAX_DIVISIONS {
            return Err(DeweyIdError::TooLong(divisions.len()));
        }
        Ok(Self { divisions })
    }

    /// Creates a key from a slice of divisions.
    pub fn from_divisions(divisions: &[u32]) -> Result<Self, DeweyIdError> {
        Self::new(divisions.to_vec())
    }

    /// Creates the root key of document `doc`.
    #[must_use]
    pub fn document(doc: u32) -> Self {
        Self {
            divisions: vec![doc],
        }
    }

    /// Returns the divisions.
    #[inline]
    #[must_use]
    pub fn divisions(&self) -> &[u32] {
        &self.divisions
    }

    /// Returns the number of divisions.
    #[inline]
    #[must_use]
    pub fn level(&self) -> usize {
        self.divisions.len()
    }

    /// Returns the document number (first division).
    #[inline]
    #[must_use]
    pub fn doc(&self) -> u32 {
        self.divisions[0]
    }

    /// Returns true for a document root key.
    #[inline]
    #[must_use]
    pub fn is_document(&self) -> bool {
        self.divisions.len() == 1
    }

    /// Returns true if this key names an attribute node.
    #[inline]
    #[must_use]
    pub fn is_attribute(&self) -> bool {
        let len = self.divisions.len();
        len > 2 && self.divisions[len - 2] == ATTRIBUTE_DIVISION
    }

    /// Returns the key of the owning element.
    ///
    /// For attributes the marker division is skipped as well.
    #[must_use]
    pub fn parent(&self) -> Option<DeweyId> {
        let strip = if self.is_attribute() { 2 } else { 1 };
        let len = self.divisions.len();
        if len <= strip {
            return None;
        }
        Some(self.truncate(len - strip))
    }

    /// Returns the element child with the given division.
    #[must_use]
    pub fn child(&self, division: u32) -> DeweyId {
        let mut divisions = Vec::with_capacity(self.divisions.len() + 1);
        divisions.extend_from_slice(&self.divisions);
        divisions.push(division);
        Self { divisions }
    }

    /// Returns the attribute key with the given division.
    #[must_use]
    pub fn attribute(&self, division: u32) -> DeweyId {
        let mut divisions = Vec::with_capacity(self.divisions.len() + 2);
        divisions.extend_from_slice(&self.divisions);
        divisions.push(ATTRIBUTE_DIVISION);
        divisions.push(division);
        Self { divisions }
    }

    /// Returns the first `level` divisions as a key.
    ///
    /// `level` is clamped to `1..=self.level()`.
    #[must_use]
    pub fn truncate(&self, level: usize) -> DeweyId {
        let level = level.clamp(1, self.divisions.len());
        Self {
            divisions: self.divisions[..level].to_vec(),
        }
    }

    /// Returns true if `self` is a strict prefix of `other`.
    #[inline]
    #[must_use]
    pub fn is_ancestor_of(&self, other: &DeweyId) -> bool {
        other.divisions.len() > self.divisions.len()
            && other.divisions.starts_with(&self.divisions)
    }

    /// Returns true if `self` is `other` or a prefix of it.
    #[inline]
    #[must_use]
    pub fn is_ancestor_or_self_of(&self, other: &DeweyId) -> bool {
        other.divisions.starts_with(&self.divisions)
    }

    /// Returns true if `other` is an element child of `self`.
    #[inline]
    #[must_use]
    pub fn is_parent_of(&self, other: &DeweyId) -> bool {
        other.divisions.len() == self.divisions.len() + 1
            && !other.is_attribute()
            && other.divisions.starts_with(&self.divisions)
            && other.divisions[self.divisions.len()] != ATTRIBUTE_DIVISION
    }

    /// Returns true if both keys are element siblings (same parent, same level).
    #[must_use]
    pub fn is_sibling_of(&self, other: &DeweyId) -> bool {
        if self.is_attribute() || other.is_attribute() {
            return false;
        }
        let len = self.divisions.len();
        len == other.divisions.len()
            && len > 1
            && self.divisions[..len - 1] == other.divisions[..len - 1]
    }

    /// Exclusive upper bound of the subtree rooted at this key.
    ///
    /// Every descendant `d` satisfies `self < d < self.subtree_bound()`.
    #[must_use]
    pub fn subtree_bound(&self) -> DeweyId {
        let mut divisions = self.divisions.clone();
        let mut i = divisions.len();
        while i > 0 {
            i -= 1;
            if let Some(next) = divisions[i].checked_add(1) {
                divisions[i] = next;
                divisions.truncate(i + 1);
                return Self { divisions };
            }
        }
        // every division saturated: append to stay above the subtree
        divisions.push(u32::MAX);
        Self { divisions }
    }

    /// Smallest key an element child of this key can have.
    #[must_use]
    pub fn first_child_bound(&self) -> DeweyId {
        self.child(ATTRIBUTE_DIVISION + 1)
    }

    /// Smallest key of the following document.
    #[must_use]
    pub fn next_document_bound(&self) -> DeweyId {
        self.truncate(1).subtree_bound()
    }

    /// Encoded size in bytes.
    #[inline]
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        2 + 4 * self.divisions.len()
    }

    /// Appends the encoding (division count, then divisions; big-endian).
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.divisions.len() as u16);
        for division in &self.divisions {
            buf.put_u32(*division);
        }
    }

    /// Decodes a key and advances `buf` past it.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, DeweyIdError> {
        if buf.remaining() < 2 {
            return Err(DeweyIdError::Truncated {
                needed: 2,
                available: buf.remaining(),
            });
        }
        let count = buf.get_u16() as usize;
        if buf.remaining() < count * 4 {
            return Err(DeweyIdError::Truncated {
                needed: count * 4,
                available: buf.remaining(),
            });
        }
        let divisions = (0..count).map(|_| buf.get_u32()).collect();
        Self::new(divisions)
    }

    /// Returns the encoding as owned bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes a key from a byte slice.
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, DeweyIdError> {
        Self::decode(&mut bytes)
    }
}

impl fmt::Debug for DeweyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeweyId({self})")
    }
}

impl fmt::Display for DeweyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, division) in self.divisions.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            write!(f, "{division}")?;
        }
        Ok(())
    }
}

impl FromStr for DeweyId {
    type Err = DeweyIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let divisions = s
            .split('.')
            .map(|part| {
                part.trim()
                    .parse::<u32>()
                    .map_err(|_| DeweyIdError::Parse(s.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(divisions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> DeweyId {
        s.parse().unwrap()
    }

    #[test]
    fn test_document_order() {
        let mut keys = vec![key("2"), key("1.2"), key("1"), key("1.1.1"), key("1.0.1"), key("1.1")];
        keys.sort();
        let order: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(order, ["1", "1.0.1", "1.1", "1.1.1", "1.2", "2"]);
    }

    #[test]
    fn test_attribute_detection() {
        assert!(key("1.0.3").is_attribute());
        assert!(!key("1.1").is_attribute());
        assert!(!key("1.0").is_attribute());
        assert!(!key("1.1.3").is_attribute());
        assert_eq!(key("1.2.0.7").parent(), Some(key("1.2")));
    }

    #[test]
    fn test_family_relations() {
        let root = key("1");
        assert_eq!(key("1.2").parent(), Some(root.clone()));
        assert_eq!(root.parent(), None);
        assert!(root.is_parent_of(&key("1.1")));
        assert!(!root.is_parent_of(&key("1.0.1")));
        assert!(!root.is_parent_of(&key("1.1.1")));
        assert!(root.is_ancestor_of(&key("1.1.1")));
        assert!(!root.is_ancestor_of(&root));
        assert!(key("1.1").is_sibling_of(&key("1.5")));
        assert!(!key("1.1").is_sibling_of(&key("2.1")));
        assert!(!key("1").is_sibling_of(&key("2")));
    }

    #[test]
    fn test_subtree_bound() {
        let node = key("1.3");
        let bound = node.subtree_bound();
        assert_eq!(bound, key("1.4"));
        assert!(key("1.3.9.9") < bound);
        assert_eq!(key("1.3").first_child_bound(), key("1.3.1"));
        assert_eq!(key("4.5.6").next_document_bound(), key("5"));

        let saturated = DeweyId::new(vec![1, u32::MAX]).unwrap();
        assert_eq!(saturated.subtree_bound(), key("2"));
    }

    #[test]
    fn test_encoding() {
        let original = key("7.0.3.12");
        let bytes = original.to_bytes();
        assert_eq!(bytes.len(), original.encoded_len());
        assert_eq!(DeweyId::from_bytes(&bytes).unwrap(), original);

        let err = DeweyId::from_bytes(&bytes[..5]).unwrap_err();
        assert!(matches!(err, DeweyIdError::Truncated { .. }));
        assert_eq!(DeweyId::from_bytes(&[0, 0]).unwrap_err(), DeweyIdError::Empty);
    }

    #[test]
    fn test_parse_errors() {
        assert!("1.x".parse::<DeweyId>().is_err());
        assert!("".parse::<DeweyId>().is_err());
        assert_eq!(key(" 3 . 4 ").divisions(), &[3, 4]);
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Holder {
        key: DeweyId,
    }

    #[test]
    fn test_deserialize_validates_divisions() {
        let text = toml::to_string(&Holder { key: key("1.3.2") }).unwrap();
        assert_eq!(toml::from_str::<Holder>(&text).unwrap().key, key("1.3.2"));

        let err = toml::from_str::<Holder>("key = []").unwrap_err();
        assert!(err.to_string().contains("at least one division"), "{err}");
        let long = format!("key = {:?}", vec![1u32; MAX_DIVISIONS + 1]);
        assert!(toml::from_str::<Holder>(&long).is_err());
    }
}
