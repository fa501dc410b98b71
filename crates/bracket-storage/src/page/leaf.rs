//! Leaf page context.

use bytes::{Buf, BufMut};

use bracket_common::types::{DeweyId, NodeRecord, PageId, PageKind};

use super::context::TreeContext;
use super::error::{PageError, PageResult};
use super::{get_opt_key, get_page_opt, get_record, put_opt_key, put_record, record_len};

/// Leaf header after the tree header: next(8) + high key flag(1) + count(2).
pub const LEAF_HEADER_SIZE: usize = 8 + 1 + 2;

/// Records of one leaf, in strictly increasing key order.
///
/// `high_key` is the exclusive upper bound of the keys routed to this leaf;
/// the last leaf of an index has none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafPage {
    root: PageId,
    prev: Option<PageId>,
    next: Option<PageId>,
    high_key: Option<DeweyId>,
    records: Vec<NodeRecord>,
}

impl LeafPage {
    /// Creates an empty leaf of the index rooted at `root`.
    pub fn new(root: PageId) -> Self {
        Self {
            root,
            prev: None,
            next: None,
            high_key: None,
            records: Vec::new(),
        }
    }

    /// Next leaf in key order.
    pub fn next(&self) -> Option<PageId> {
        self.next
    }

    /// Sets the next pointer.
    pub fn set_next(&mut self, next: Option<PageId>) {
        self.next = next;
    }

    /// Exclusive upper bound of this leaf.
    pub fn high_key(&self) -> Option<&DeweyId> {
        self.high_key.as_ref()
    }

    /// Sets the high key.
    pub fn set_high_key(&mut self, high_key: Option<DeweyId>) {
        self.high_key = high_key;
    }

    /// All records in key order.
    pub fn records(&self) -> &[NodeRecord] {
        &self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the leaf holds no record.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record at `slot`.
    pub fn get(&self, slot: usize) -> Option<&NodeRecord> {
        self.records.get(slot)
    }

    /// Binary search by key; `Err` carries the insert position.
    pub fn search(&self, key: &DeweyId) -> Result<usize, usize> {
        self.records.binary_search_by(|r| r.key.cmp(key))
    }

    /// Record with exactly `key`.
    pub fn find(&self, key: &DeweyId) -> Option<&NodeRecord> {
        self.search(key).ok().map(|slot| &self.records[slot])
    }

    /// Returns true if `key` is routed to this leaf by its high key and is
    /// not below its first record.
    pub fn covers(&self, key: &DeweyId) -> bool {
        let below_high = self.high_key.as_ref().map_or(true, |high| key < high);
        let above_first = self.records.first().is_some_and(|first| &first.key <= key);
        below_high && above_first
    }

    /// Inserts a record at its key position.
    pub fn insert(&mut self, page: PageId, record: NodeRecord) -> PageResult<usize> {
        match self.search(&record.key) {
            Ok(_) => Err(PageError::DuplicateKey {
                page,
                key: record.key,
            }),
            Err(slot) => {
                self.records.insert(slot, record);
                Ok(slot)
            }
        }
    }

    /// Removes the record with `key`.
    pub fn remove(&mut self, page: PageId, key: &DeweyId) -> PageResult<NodeRecord> {
        match self.search(key) {
            Ok(slot) => Ok(self.records.remove(slot)),
            Err(_) => Err(PageError::KeyNotFound {
                page,
                key: key.clone(),
            }),
        }
    }

    /// Replaces the record with the same key. Returns the old record.
    pub fn update(&mut self, page: PageId, record: NodeRecord) -> PageResult<NodeRecord> {
        match self.search(&record.key) {
            Ok(slot) => Ok(std::mem::replace(&mut self.records[slot], record)),
            Err(_) => Err(PageError::KeyNotFound {
                page,
                key: record.key,
            }),
        }
    }

    /// First slot of the right half when splitting at `occupancy` of the
    /// record bytes. Both halves keep at least one record.
    pub fn split_slot(&self, occupancy: f64) -> usize {
        if self.records.len() < 2 {
            return self.records.len();
        }
        let total: usize = self.records.iter().map(record_len).sum();
        let target = (total as f64 * occupancy.clamp(0.0, 1.0)) as usize;

        let mut acc = 0;
        for (slot, record) in self.records.iter().enumerate() {
            acc += record_len(record);
            if acc > target {
                return slot.clamp(1, self.records.len() - 1);
            }
        }
        self.records.len() - 1
    }

    /// A copy of this leaf's records and context, used when the root moves
    /// its content into a fresh page.
    pub fn copy_content_and_context(&self) -> LeafPage {
        self.clone()
    }

    pub(super) fn body_len(&self) -> usize {
        LEAF_HEADER_SIZE
            + self.high_key.as_ref().map_or(0, DeweyId::encoded_len)
            + self.records.iter().map(record_len).sum::<usize>()
    }

    pub(super) fn encode_body(&self, buf: &mut impl BufMut) {
        buf.put_slice(&PageId::encode_opt(self.next));
        put_opt_key(buf, self.high_key.as_ref());
        buf.put_u16(self.records.len() as u16);
        for record in &self.records {
            put_record(buf, record);
        }
    }

    pub(super) fn decode_body(
        page: PageId,
        root: PageId,
        prev: Option<PageId>,
        buf: &mut &[u8],
    ) -> PageResult<Self> {
        let next = get_page_opt(page, buf)?;
        let high_key = get_opt_key(page, buf)?;
        if buf.remaining() < 2 {
            return Err(PageError::corrupted(page, "truncated record count"));
        }
        let count = buf.get_u16() as usize;
        let records = (0..count)
            .map(|_| get_record(page, buf))
            .collect::<PageResult<Vec<_>>>()?;
        if records.windows(2).any(|w| w[0].key >= w[1].key) {
            return Err(PageError::corrupted(page, "leaf keys out of order"));
        }
        Ok(Self {
            root,
            prev,
            next,
            high_key,
            records,
        })
    }
}

impl TreeContext for LeafPage {
    fn kind(&self) -> PageKind {
        PageKind::Leaf
    }

    fn root(&self) -> PageId {
        self.root
    }

    fn prev(&self) -> Option<PageId> {
        self.prev
    }

    fn set_prev(&mut self, prev: Option<PageId>) {
        self.prev = prev;
    }

    fn height(&self) -> u16 {
        0
    }

    fn entry_count(&self) -> usize {
        self.records.len()
    }

    fn first_key(&self) -> Option<&DeweyId> {
        self.records.first().map(|r| &r.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> DeweyId {
        s.parse().unwrap()
    }

    fn leaf(keys: &[&str]) -> LeafPage {
        let mut leaf = LeafPage::new(PageId::new(1, 1));
        for k in keys {
            leaf.insert(PageId::new(1, 1), NodeRecord::new(key(k), &b"value"[..]))
                .unwrap();
        }
        leaf
    }

    #[test]
    fn test_insert_keeps_order() {
        let leaf = leaf(&["1.2", "1", "2", "1.1"]);
        let keys: Vec<String> = leaf.records().iter().map(|r| r.key.to_string()).collect();
        assert_eq!(keys, ["1", "1.1", "1.2", "2"]);
    }

    #[test]
    fn test_duplicate_and_missing() {
        let page = PageId::new(1, 1);
        let mut leaf = leaf(&["1"]);
        assert!(matches!(
            leaf.insert(page, NodeRecord::new(key("1"), &b""[..])),
            Err(PageError::DuplicateKey { .. })
        ));
        assert!(matches!(
            leaf.remove(page, &key("3")),
            Err(PageError::KeyNotFound { .. })
        ));
        let old = leaf
            .update(page, NodeRecord::new(key("1"), &b"new"[..]))
            .unwrap();
        assert_eq!(&old.value[..], b"value");
        assert_eq!(&leaf.find(&key("1")).unwrap().value[..], b"new");
    }

    #[test]
    fn test_split_slot_keeps_both_halves() {
        let leaf = leaf(&["1", "1.1", "1.2", "1.3"]);
        assert_eq!(leaf.split_slot(0.5), 2);
        assert_eq!(leaf.split_slot(0.0), 1);
        assert_eq!(leaf.split_slot(1.0), 3);
    }

    #[test]
    fn test_covers() {
        let mut leaf = leaf(&["1.1", "1.5"]);
        leaf.set_high_key(Some(key("2")));
        assert!(leaf.covers(&key("1.3")));
        assert!(!leaf.covers(&key("1")));
        assert!(!leaf.covers(&key("2")));
        leaf.set_high_key(None);
        assert!(leaf.covers(&key("9")));
    }
}
