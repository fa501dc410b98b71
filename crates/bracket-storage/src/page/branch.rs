//! Branch page context.

use bytes::{Buf, BufMut};

use bracket_common::types::{DeweyId, PageId, PageKind};

use super::context::TreeContext;
use super::error::{PageError, PageResult};
use super::get_page_opt;

/// Branch header after the tree header: low(8) + count(2).
pub const BRANCH_HEADER_SIZE: usize = 8 + 2;

/// Which pointer of a branch leads to a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSlot {
    /// The low pointer, for keys below the first separator.
    Low,
    /// The child of separator `i`.
    Entry(usize),
}

/// Separators and child pointers of one branch.
///
/// Child of separator `i` holds the keys in `[key_i, key_{i+1})`; `low`
/// holds every key below `key_0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchPage {
    root: PageId,
    prev: Option<PageId>,
    height: u16,
    low: Option<PageId>,
    entries: Vec<(DeweyId, PageId)>,
}

impl BranchPage {
    /// Creates an empty branch at `height` (leaves are at 0).
    pub fn new(root: PageId, height: u16) -> Self {
        Self {
            root,
            prev: None,
            height,
            low: None,
            entries: Vec::new(),
        }
    }

    /// The low pointer.
    pub fn low(&self) -> Option<PageId> {
        self.low
    }

    /// Sets the low pointer.
    pub fn set_low(&mut self, low: Option<PageId>) {
        self.low = low;
    }

    /// Separator entries in key order.
    pub fn entries(&self) -> &[(DeweyId, PageId)] {
        &self.entries
    }

    /// Number of children (low included).
    pub fn child_count(&self) -> usize {
        self.entries.len() + usize::from(self.low.is_some())
    }

    /// Child responsible for `key`.
    pub fn child_for(&self, key: &DeweyId) -> Option<PageId> {
        match self.entries.partition_point(|(sep, _)| sep <= key) {
            0 => self.low,
            i => Some(self.entries[i - 1].1),
        }
    }

    /// Slot of the pointer leading to `child`.
    pub fn slot_of(&self, child: PageId) -> Option<ChildSlot> {
        if self.low == Some(child) {
            return Some(ChildSlot::Low);
        }
        self.entries
            .iter()
            .position(|(_, c)| *c == child)
            .map(ChildSlot::Entry)
    }

    /// Child of the pointer right of `slot`.
    pub fn right_of(&self, slot: ChildSlot) -> Option<PageId> {
        let next = match slot {
            ChildSlot::Low => 0,
            ChildSlot::Entry(i) => i + 1,
        };
        self.entries.get(next).map(|(_, child)| *child)
    }

    /// Inserts a separator.
    pub fn insert(&mut self, page: PageId, key: DeweyId, child: PageId) -> PageResult<usize> {
        match self.entries.binary_search_by(|(sep, _)| sep.cmp(&key)) {
            Ok(_) => Err(PageError::DuplicateKey { page, key }),
            Err(slot) => {
                self.entries.insert(slot, (key, child));
                Ok(slot)
            }
        }
    }

    /// Removes a separator and returns its child.
    pub fn remove(&mut self, page: PageId, key: &DeweyId) -> PageResult<PageId> {
        match self.entries.binary_search_by(|(sep, _)| sep.cmp(key)) {
            Ok(slot) => Ok(self.entries.remove(slot).1),
            Err(_) => Err(PageError::KeyNotFound {
                page,
                key: key.clone(),
            }),
        }
    }

    /// Changes the child of a separator and returns the old child.
    pub fn update(&mut self, page: PageId, key: &DeweyId, child: PageId) -> PageResult<PageId> {
        match self.entries.binary_search_by(|(sep, _)| sep.cmp(key)) {
            Ok(slot) => Ok(std::mem::replace(&mut self.entries[slot].1, child)),
            Err(_) => Err(PageError::KeyNotFound {
                page,
                key: key.clone(),
            }),
        }
    }

    pub(super) fn body_len(&self) -> usize {
        BRANCH_HEADER_SIZE
            + self
                .entries
                .iter()
                .map(|(key, _)| key.encoded_len() + PageId::SIZE)
                .sum::<usize>()
    }

    pub(super) fn encode_body(&self, buf: &mut impl BufMut) {
        buf.put_slice(&PageId::encode_opt(self.low));
        buf.put_u16(self.entries.len() as u16);
        for (key, child) in &self.entries {
            key.encode(buf);
            buf.put_slice(&child.to_be_bytes());
        }
    }

    pub(super) fn decode_body(
        page: PageId,
        root: PageId,
        prev: Option<PageId>,
        height: u16,
        buf: &mut &[u8],
    ) -> PageResult<Self> {
        let low = get_page_opt(page, buf)?;
        if buf.remaining() < 2 {
            return Err(PageError::corrupted(page, "truncated separator count"));
        }
        let count = buf.get_u16() as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key = DeweyId::decode(buf).map_err(|e| PageError::corrupted(page, e.to_string()))?;
            let child = get_page_opt(page, buf)?
                .ok_or_else(|| PageError::corrupted(page, "separator without child"))?;
            entries.push((key, child));
        }
        Ok(Self {
            root,
            prev,
            height,
            low,
            entries,
        })
    }
}

impl TreeContext for BranchPage {
    fn kind(&self) -> PageKind {
        PageKind::Branch
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
        self.height
    }

    fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn first_key(&self) -> Option<&DeweyId> {
        self.entries.first().map(|(key, _)| key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> DeweyId {
        s.parse().unwrap()
    }

    #[test]
    fn test_routing() {
        let page = PageId::new(1, 2);
        let mut branch = BranchPage::new(page, 1);
        branch.set_low(Some(PageId::new(1, 10)));
        branch.insert(page, key("1.5"), PageId::new(1, 11)).unwrap();
        branch.insert(page, key("3"), PageId::new(1, 12)).unwrap();

        assert_eq!(branch.child_for(&key("1.1")), Some(PageId::new(1, 10)));
        assert_eq!(branch.child_for(&key("1.5")), Some(PageId::new(1, 11)));
        assert_eq!(branch.child_for(&key("2.9")), Some(PageId::new(1, 11)));
        assert_eq!(branch.child_for(&key("7")), Some(PageId::new(1, 12)));
        assert_eq!(branch.child_count(), 3);

        assert_eq!(branch.slot_of(PageId::new(1, 10)), Some(ChildSlot::Low));
        assert_eq!(branch.slot_of(PageId::new(1, 12)), Some(ChildSlot::Entry(1)));
        assert_eq!(branch.right_of(ChildSlot::Low), Some(PageId::new(1, 11)));
        assert_eq!(branch.right_of(ChildSlot::Entry(1)), None);
    }

    #[test]
    fn test_separator_updates() {
        let page = PageId::new(1, 2);
        let mut branch = BranchPage::new(page, 1);
        branch.insert(page, key("2"), PageId::new(1, 5)).unwrap();
        assert!(branch.insert(page, key("2"), PageId::new(1, 6)).is_err());
        assert_eq!(
            branch.update(page, &key("2"), PageId::new(1, 6)).unwrap(),
            PageId::new(1, 5)
        );
        assert_eq!(branch.remove(page, &key("2")).unwrap(), PageId::new(1, 6));
        assert!(branch.remove(page, &key("2")).is_err());
    }
}
