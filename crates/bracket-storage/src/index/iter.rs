//! Cursors over a bracket index.

use std::fmt;
use std::ops::Bound;

use bytes::Bytes;
use tracing::trace;

use bracket_common::types::{DeweyId, Lsn, NodeRecord, PageId};
use bracket_wal::{LogOperation, Tx};

use super::error::{IndexOperationError, IndexResult};
use super::navigation::{NavigationMode, NavigationStatus, OpenMode};
use super::tree::{BracketTree, LogAs, Navigated};
use crate::buffer::{LatchMode, PageGuard};
use crate::page::record_len;

/// Where a cursor last stood: enough to find a record again without a
/// descent if its leaf did not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HintPageInformation {
    /// Leaf page.
    pub page: PageId,
    /// LSN of the leaf when the hint was taken.
    pub lsn: Lsn,
    /// Slot of the record.
    pub slot: usize,
}

/// A cursor positioned on one record of an index.
///
/// The cursor keeps its leaf latched until it moves off the leaf or is
/// closed. [`OpenMode::Update`] cursors hold an update latch and upgrade it
/// to exclusive when they change the leaf. Operations that may restructure
/// the tree release the latch first and position the cursor again afterwards.
pub struct BracketIter {
    tree: BracketTree,
    root: PageId,
    mode: OpenMode,
    guard: Option<PageGuard>,
    slot: usize,
}

impl BracketIter {
    pub(crate) fn new(
        tree: BracketTree,
        root: PageId,
        mode: OpenMode,
        guard: PageGuard,
        slot: usize,
    ) -> Self {
        Self {
            tree,
            root,
            mode,
            guard: Some(guard),
            slot,
        }
    }

    /// Root page of the index.
    pub fn root(&self) -> PageId {
        self.root
    }

    /// Access intent the cursor was opened with.
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Returns true while the cursor stands on a record.
    pub fn is_positioned(&self) -> bool {
        self.record().is_some()
    }

    /// The current record as stored, with an external value left as a blob
    /// reference.
    pub fn record(&self) -> Option<NodeRecord> {
        let guard = self.guard.as_ref()?;
        let page = guard.page();
        let record = page.leaf().ok()?.get(self.slot).cloned();
        record
    }

    /// Key of the current record.
    pub fn key(&self) -> Option<DeweyId> {
        self.record().map(|record| record.key)
    }

    /// Value of the current record, read from its blob chain if needed.
    pub fn value(&self) -> IndexResult<Bytes> {
        let record = self.record().ok_or(IndexOperationError::NotPositioned)?;
        self.tree.resolve_value(&record)
    }

    /// Hint for finding the current record again.
    pub fn hint(&self) -> Option<HintPageInformation> {
        let guard = self.guard.as_ref()?;
        let lsn = guard.page().lsn();
        Some(HintPageInformation {
            page: guard.page_id(),
            lsn,
            slot: self.slot,
        })
    }

    /// Releases the leaf. The cursor is no longer positioned.
    pub fn close(&mut self) {
        self.guard = None;
    }

    /// Moves to the next record in key order.
    ///
    /// At the end of the index the cursor stays where it is and `false` is
    /// returned.
    pub fn next(&mut self) -> IndexResult<bool> {
        let guard = self
            .guard
            .as_mut()
            .ok_or(IndexOperationError::NotPositioned)?;
        step_forward(&self.tree, self.root, self.mode.latch(), guard, &mut self.slot)
    }

    /// Moves relative to the current record.
    ///
    /// If the target does not exist the cursor stays on the current record,
    /// which may have to be found again because the leaf was released.
    pub fn navigate(&mut self, mode: NavigationMode) -> IndexResult<NavigationStatus> {
        let current = self.key().ok_or(IndexOperationError::NotPositioned)?;
        self.guard = None;
        match self
            .tree
            .navigate(self.root, mode, &current, self.mode.latch())?
        {
            Navigated::Found(guard, slot) => {
                self.guard = Some(guard);
                self.slot = slot;
                Ok(NavigationStatus::Found)
            }
            Navigated::Missing(status) => {
                trace!(root = %self.root, key = %current, ?mode, ?status, "navigation missed");
                self.reposition(&current)?;
                Ok(status)
            }
        }
    }

    /// Inserts a record whose key follows the current one and moves onto it.
    pub fn insert(&mut self, tx: &Tx, key: DeweyId, value: impl Into<Bytes>) -> IndexResult<()> {
        let current = self.key().ok_or(IndexOperationError::NotPositioned)?;
        if key <= current {
            return Err(IndexOperationError::UnorderedSequence {
                previous: current,
                key,
            });
        }
        let value = value.into();

        if self.mode == OpenMode::Update && value.len() <= self.tree.externalize_threshold(self.root)? {
            let record = self.tree.prepare_record(tx, self.root, &key, value.clone())?;
            if self.insert_in_place(tx, &record)? {
                return Ok(());
            }
        }

        self.guard = None;
        let record = self.tree.prepare_record(tx, self.root, &key, value)?;
        if let Err(err) = self.tree.insert(tx, self.root, record.clone()) {
            self.tree.discard_prepared(tx, self.root, &record);
            return Err(err);
        }
        self.reposition(&key)
    }

    /// Replaces the value of the current record.
    pub fn update(&mut self, tx: &Tx, value: impl Into<Bytes>) -> IndexResult<()> {
        let key = self.key().ok_or(IndexOperationError::NotPositioned)?;
        let value = value.into();

        if self.mode == OpenMode::Update && value.len() <= self.tree.externalize_threshold(self.root)? {
            let record = self.tree.prepare_record(tx, self.root, &key, value.clone())?;
            if self.update_in_place(tx, &record)? {
                return Ok(());
            }
        }

        self.guard = None;
        let record = self.tree.prepare_record(tx, self.root, &key, value)?;
        if let Err(err) = self.tree.update(tx, self.root, record.clone()) {
            self.tree.discard_prepared(tx, self.root, &record);
            return Err(err);
        }
        self.reposition(&key)
    }

    /// Deletes the current record and moves to the one after it.
    ///
    /// Returns false if no record follows; the cursor is then closed.
    pub fn delete(&mut self, tx: &Tx) -> IndexResult<bool> {
        let key = self.key().ok_or(IndexOperationError::NotPositioned)?;
        self.guard = None;
        self.tree.delete(tx, self.root, &key)?;
        self.seek_from(&key)
    }

    /// Deletes the current record with all its descendants and moves to the
    /// first record after the subtree. Returns the number of records deleted.
    pub fn delete_subtree(&mut self, tx: &Tx) -> IndexResult<usize> {
        let key = self.key().ok_or(IndexOperationError::NotPositioned)?;
        self.guard = None;
        let bound = key.subtree_bound();
        let deleted = self
            .tree
            .delete_range(tx, self.root, &key, Bound::Excluded(&bound))?;
        self.seek_from(&bound)?;
        Ok(deleted)
    }

    // ===== Internal =====

    fn insert_in_place(&mut self, tx: &Tx, record: &NodeRecord) -> IndexResult<bool> {
        let root = self.root;
        let Some(guard) = self.guard.as_mut() else {
            return Ok(false);
        };
        let slot = {
            let page = guard.page();
            let leaf = page.leaf()?;
            if leaf.high_key().is_some_and(|high| &record.key >= high)
                || !page.fits(record_len(record))
            {
                return Ok(false);
            }
            match leaf.search(&record.key) {
                Ok(_) => {
                    return Err(IndexOperationError::DuplicateKey {
                        root,
                        key: record.key.clone(),
                    })
                }
                Err(slot) => slot,
            }
        };
        let page = guard.page_id();
        self.tree.apply_logged(
            tx,
            guard,
            LogOperation::LeafInsert {
                page,
                root,
                record: record.clone(),
            },
            LogAs::Update,
        )?;
        self.slot = slot;
        Ok(true)
    }

    fn update_in_place(&mut self, tx: &Tx, record: &NodeRecord) -> IndexResult<bool> {
        let root = self.root;
        let Some(guard) = self.guard.as_mut() else {
            return Ok(false);
        };
        let (old, fits, unit) = {
            let page = guard.page();
            let old = page
                .leaf()?
                .get(self.slot)
                .cloned()
                .ok_or(IndexOperationError::NotPositioned)?;
            let growth = record_len(record).saturating_sub(record_len(&old));
            (old, page.fits(growth), page.unit())
        };
        if !fits {
            return Ok(false);
        }
        let page = guard.page_id();
        let old_blob = old.blob_page();
        self.tree.apply_logged(
            tx,
            guard,
            LogOperation::LeafUpdate {
                page,
                root,
                old,
                new: record.clone(),
            },
            LogAs::Update,
        )?;
        if let Some(blob) = old_blob {
            self.tree.blobs().drop(tx, blob, unit);
        }
        Ok(true)
    }

    /// Positions on `key`, or on the first record after it if it is gone.
    fn reposition(&mut self, key: &DeweyId) -> IndexResult<()> {
        match self.tree.seek_exact(self.root, key, self.mode.latch())? {
            Some((guard, slot)) => {
                self.guard = Some(guard);
                self.slot = slot;
            }
            None => {
                self.seek_from(key)?;
            }
        }
        Ok(())
    }

    fn seek_from(&mut self, bound: &DeweyId) -> IndexResult<bool> {
        match self.tree.seek_at_least(self.root, bound, self.mode.latch())? {
            Some((guard, slot)) => {
                self.guard = Some(guard);
                self.slot = slot;
                Ok(true)
            }
            None => {
                self.guard = None;
                Ok(false)
            }
        }
    }
}

impl fmt::Debug for BracketIter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BracketIter")
            .field("root", &self.root)
            .field("mode", &self.mode)
            .field("page", &self.guard.as_ref().map(PageGuard::page_id))
            .field("slot", &self.slot)
            .finish()
    }
}

/// Records of one subtree in document order, with values resolved.
///
/// The stream keeps the current leaf latched shared between calls.
pub struct SubtreeStream {
    tree: BracketTree,
    root: PageId,
    start: Option<DeweyId>,
    skip: Option<DeweyId>,
    bound: DeweyId,
    guard: Option<PageGuard>,
    slot: usize,
    finished: bool,
}

impl SubtreeStream {
    pub(crate) fn new(tree: BracketTree, root: PageId, key: &DeweyId, include_self: bool) -> Self {
        Self {
            tree,
            root,
            start: Some(key.clone()),
            skip: (!include_self).then(|| key.clone()),
            bound: key.subtree_bound(),
            guard: None,
            slot: 0,
            finished: false,
        }
    }

    fn advance(&mut self) -> IndexResult<Option<(DeweyId, Bytes)>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            if let Some(start) = self.start.take() {
                match self.tree.seek_at_least(self.root, &start, LatchMode::Shared)? {
                    Some((guard, slot)) => {
                        self.guard = Some(guard);
                        self.slot = slot;
                    }
                    None => {
                        self.finish();
                        return Ok(None);
                    }
                }
            } else {
                let guard = self
                    .guard
                    .as_mut()
                    .ok_or(IndexOperationError::NotPositioned)?;
                if !step_forward(&self.tree, self.root, LatchMode::Shared, guard, &mut self.slot)? {
                    self.finish();
                    return Ok(None);
                }
            }

            let record = {
                let guard = self
                    .guard
                    .as_ref()
                    .ok_or(IndexOperationError::NotPositioned)?;
                let page = guard.page();
                let record = page.leaf()?.get(self.slot).cloned();
                record
            }
            .ok_or(IndexOperationError::NotPositioned)?;

            if record.key >= self.bound {
                self.finish();
                return Ok(None);
            }
            if self.skip.as_ref() == Some(&record.key) {
                continue;
            }
            let value = self.tree.resolve_value(&record)?;
            return Ok(Some((record.key, value)));
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.guard = None;
    }
}

impl Iterator for SubtreeStream {
    type Item = IndexResult<(DeweyId, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(item) => item.map(Ok),
            Err(err) => {
                self.finish();
                Some(Err(err))
            }
        }
    }
}

impl fmt::Debug for SubtreeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubtreeStream")
            .field("root", &self.root)
            .field("bound", &self.bound)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Moves to the record after `slot`, skipping empty leaves.
///
/// Returns false at the end of the chain and leaves the position unchanged.
fn step_forward(
    tree: &BracketTree,
    root: PageId,
    mode: LatchMode,
    guard: &mut PageGuard,
    slot: &mut usize,
) -> IndexResult<bool> {
    let (len, mut next) = {
        let page = guard.page();
        let leaf = page.leaf()?;
        (leaf.len(), leaf.next())
    };
    if *slot + 1 < len {
        *slot += 1;
        return Ok(true);
    }

    let mut from = guard.page_id();
    let mut _held: Option<PageGuard> = None;
    while let Some(page) = next {
        let sibling = tree.fix_sibling(page, root, from, mode)?;
        let (len, after) = {
            let content = sibling.page();
            let leaf = content.leaf()?;
            (leaf.len(), leaf.next())
        };
        if len > 0 {
            *guard = sibling;
            *slot = 0;
            return Ok(true);
        }
        from = page;
        next = after;
        _held = Some(sibling);
    }
    Ok(false)
}
