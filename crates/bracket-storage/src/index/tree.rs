//! Bracket tree: descent, record changes and structure modifications.
//!
//! Every page change goes through [`BracketTree::apply_logged`]: the change
//! is applied to the X-latched page first (all or nothing), then logged, then
//! the page LSN is set. If logging fails the page is restored.
//!
//! Structure modifications take X latches from the root down to the leaf and
//! run as nested top actions, so rollback skips them once they completed.
//!
//! ```text
//!   split leaf L (parent P)              unchain empty leaf L
//!
//!        P                                    P
//!      /   \                                /   \
//!     L ──► N          ==>                 V ──► L ──► N     ==>   V ──► N
//!
//!        P + sep(R)
//!      /   |   \
//!     L ──►R ──► N
//! ```

use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, trace, warn};

use bracket_common::types::{ContainerId, DeweyId, Lsn, NodeRecord, PageId, PageKind, UnitId};
use bracket_wal::{FormatState, LogOperation, PendingAction, PointerField, Tx, TxState};

use super::error::{IndexAccessError, IndexOperationError, IndexResult, Phase};
use super::iter::HintPageInformation;
use super::navigation::{Accept, NavigationMode, NavigationStatus, Seek, Verdict};
use crate::blob::BlobStore;
use crate::buffer::{BufferManager, LatchMode, PageGuard};
use crate::page::{
    record_len, ChildSlot, InsertOutcome, LeafPage, Page, PageContext, PageError, TreeContext,
};

/// Rounds of structure modification an insert may trigger before giving up.
const MAX_STRUCTURE_ROUNDS: usize = 64;

/// Attempts to unchain an empty leaf whose left neighbor stays latched.
const MAX_UNCHAIN_ATTEMPTS: usize = 16;

/// How a page change is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LogAs {
    /// An undoable update.
    Update,
    /// A compensation record with this undo-next LSN.
    Compensation(Lsn),
}

/// Logical undo of one record change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Compensation {
    /// Remove a record that was inserted.
    Remove(NodeRecord),
    /// Put back a record that was deleted.
    Restore(NodeRecord),
    /// Put back the previous version of an updated record.
    Revert(NodeRecord),
}

/// Result of a tree walk for a navigation mode.
#[derive(Debug)]
pub(crate) enum Navigated {
    /// Positioned on a record.
    Found(PageGuard, usize),
    /// No matching record.
    Missing(NavigationStatus),
}

/// Summary of a successful [`BracketTree::verify`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Leaves in the chain.
    pub leaves: usize,
    /// Records in all leaves.
    pub records: usize,
}

/// Tunables taken from the storage configuration.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TreeOptions {
    /// Fraction of record bytes the left page keeps on an occupancy split.
    pub split_occupancy: f64,
    /// Values longer than `usable leaf space / externalize_fraction` become blobs.
    pub externalize_fraction: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Unchain {
    Done,
    Skipped,
    Busy,
    /// The left neighbor cannot take the longer high key; split it first.
    PrevFull { last: DeweyId, growth: usize },
}

/// Operations on bracket trees stored in the buffer's containers.
///
/// The tree itself is stateless: every operation names the root page of the
/// index it works on.
#[derive(Clone)]
pub(crate) struct BracketTree {
    buffer: Arc<BufferManager>,
    blobs: BlobStore,
    options: TreeOptions,
}

impl BracketTree {
    pub(crate) fn new(buffer: Arc<BufferManager>, options: TreeOptions) -> Self {
        let blobs = BlobStore::new(Arc::clone(&buffer));
        Self {
            buffer,
            blobs,
            options,
        }
    }

    pub(crate) fn buffer(&self) -> &Arc<BufferManager> {
        &self.buffer
    }

    pub(crate) fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    // ===== Index lifecycle =====

    /// Creates an empty index and returns its root page.
    ///
    /// Without a unit, a fresh unit is created for the index.
    pub(crate) fn create_index(
        &self,
        tx: &Tx,
        container: ContainerId,
        unit: Option<UnitId>,
    ) -> IndexResult<PageId> {
        let unit = match unit {
            Some(unit) => unit,
            None => {
                let space = self.buffer.space(container)?;
                let unit = space.create_unit(None, false)?;
                if let Err(err) = tx.log_update(LogOperation::CreateUnit { container, unit }) {
                    if let Err(drop_err) = space.drop_unit(unit, true) {
                        warn!(%container, %unit, error = %drop_err, "could not drop unlogged unit");
                    }
                    return Err(err.into());
                }
                unit
            }
        };

        let mut root = self.buffer.create_page(tx, container, unit)?;
        let id = root.page_id();
        self.format(
            tx,
            &mut root,
            FormatState {
                kind: PageKind::Leaf,
                unit,
                root: id,
                height: 0,
            },
        )?;
        debug!(txn = %tx.id(), root = %id, %unit, "created index");
        Ok(id)
    }

    /// Schedules the unit of the index for dropping at commit.
    pub(crate) fn drop_index(&self, tx: &Tx, root: PageId) -> IndexResult<()> {
        let guard = self.fix_node(root, root, LatchMode::Shared)?;
        let unit = guard.page().unit();
        drop(guard);
        tx.add_pending(PendingAction::DropUnit {
            container: root.container_id(),
            unit,
        });
        debug!(txn = %tx.id(), %root, %unit, "dropping index at commit");
        Ok(())
    }

    // ===== Logged page changes =====

    /// Applies `op` to the latched page, logs it and stamps the page LSN.
    pub(crate) fn apply_logged(
        &self,
        tx: &Tx,
        guard: &mut PageGuard,
        op: LogOperation,
        log_as: LogAs,
    ) -> IndexResult<Lsn> {
        guard.up_x();
        guard.page_mut().apply(&op)?;
        let inverse = op.inverse();
        let logged = match log_as {
            LogAs::Update => tx.log_update(op),
            LogAs::Compensation(undo_next) => tx.log_clr(op, undo_next),
        };
        match logged {
            Ok(lsn) => {
                guard.page_mut().set_lsn(lsn);
                Ok(lsn)
            }
            Err(err) => {
                if let Some(inverse) = inverse {
                    let restored = guard.page_mut().apply(&inverse);
                    if let Err(restore) = restored {
                        error!(page = %guard.page_id(), error = %restore, "could not restore page after log failure");
                    }
                }
                Err(err.into())
            }
        }
    }

    fn log_change(&self, tx: &Tx, guard: &mut PageGuard, op: LogOperation) -> IndexResult<Lsn> {
        self.apply_logged(tx, guard, op, LogAs::Update)
    }

    fn format(&self, tx: &Tx, guard: &mut PageGuard, new: FormatState) -> IndexResult<Lsn> {
        let page = guard.page_id();
        let old = guard.page().format_state();
        self.log_change(tx, guard, LogOperation::Format { page, old, new })
    }

    fn set_pointer(
        &self,
        tx: &Tx,
        guard: &mut PageGuard,
        root: PageId,
        field: PointerField,
        old: Option<PageId>,
        new: Option<PageId>,
    ) -> IndexResult<Lsn> {
        let page = guard.page_id();
        self.log_change(
            tx,
            guard,
            LogOperation::Pointer {
                field,
                page,
                root,
                old,
                new,
            },
        )
    }

    /// Runs `step` as a nested top action.
    ///
    /// A failure after something was logged leaves the tree to be repaired
    /// by rollback, so the transaction is marked aborted.
    fn structure_modification<T>(
        &self,
        tx: &Tx,
        step: impl FnOnce() -> IndexResult<T>,
    ) -> IndexResult<T> {
        let saved = tx.begin_structure_modification();
        match step() {
            Ok(value) => {
                if tx.last_lsn() != saved {
                    tx.end_structure_modification(saved)?;
                }
                Ok(value)
            }
            Err(err) => {
                if tx.last_lsn() != saved && tx.state() == TxState::Running {
                    warn!(txn = %tx.id(), error = %err, "structure modification failed, transaction must roll back");
                    tx.set_state(TxState::Aborted);
                }
                Err(err)
            }
        }
    }

    // ===== Descent =====

    /// Fixes a page of the index rooted at `root`.
    pub(crate) fn fix_node(&self, page: PageId, root: PageId, mode: LatchMode) -> IndexResult<PageGuard> {
        let guard = self.buffer.fix_page(page, mode)?;
        {
            let content = guard.page();
            let found = content
                .context()
                .ok_or(IndexOperationError::UnexpectedPageType {
                    page,
                    expected: "tree",
                })?
                .root();
            if found != root {
                return Err(IndexOperationError::RootMismatch {
                    page,
                    expected: root,
                    found,
                });
            }
        }
        Ok(guard)
    }

    /// Fixes the sibling leaf `page`, reached from `from`.
    pub(crate) fn fix_sibling(
        &self,
        page: PageId,
        root: PageId,
        from: PageId,
        mode: LatchMode,
    ) -> IndexResult<PageGuard> {
        let guard = self.buffer.fix_page(page, mode).map_err(|err| {
            if err.is_page_deleted() {
                IndexOperationError::from(IndexAccessError::PageDeleted { page })
            } else {
                err.into()
            }
        })?;
        {
            let content = guard.page();
            match content.context() {
                Some(ctx) if ctx.root() != root => {
                    return Err(IndexAccessError::RootMismatch {
                        page,
                        expected: root,
                        found: ctx.root(),
                        during: Phase::Access,
                    }
                    .into());
                }
                Some(PageContext::Leaf(_)) => {}
                _ => return Err(IndexAccessError::NotALeaf { page, from }.into()),
            }
        }
        Ok(guard)
    }

    /// Descends to the leaf responsible for `key`.
    ///
    /// Branches are latched shared and coupled; the leaf gets `mode`.
    pub(crate) fn descend_leaf(
        &self,
        root: PageId,
        key: &DeweyId,
        mode: LatchMode,
    ) -> IndexResult<PageGuard> {
        let mut guard = self.fix_node(root, root, LatchMode::Shared)?;
        loop {
            let step = {
                let page = guard.page();
                match page.tree()? {
                    PageContext::Leaf(_) => None,
                    PageContext::Branch(branch) => {
                        let child = branch.child_for(key).ok_or(
                            IndexOperationError::UnexpectedPageType {
                                page: guard.page_id(),
                                expected: "branch with a low pointer",
                            },
                        )?;
                        Some((child, branch.height()))
                    }
                }
            };
            match step {
                Some((child, height)) => {
                    let child_mode = if height == 1 { mode } else { LatchMode::Shared };
                    let child_guard = self.fix_node(child, root, child_mode)?;
                    guard = child_guard;
                }
                None if guard.mode() == mode => return Ok(guard),
                None => {
                    // the root is the only leaf; relatch it and make sure it
                    // did not grow meanwhile
                    drop(guard);
                    guard = self.fix_node(root, root, mode)?;
                    let still_leaf = guard.page().leaf().is_ok();
                    if still_leaf {
                        return Ok(guard);
                    }
                    drop(guard);
                    guard = self.fix_node(root, root, LatchMode::Shared)?;
                }
            }
        }
    }

    /// Latches the whole path from the root to the leaf for `key` exclusively.
    fn descend_exclusive(&self, root: PageId, key: &DeweyId) -> IndexResult<Vec<PageGuard>> {
        let mut path = vec![self.fix_node(root, root, LatchMode::Exclusive)?];
        loop {
            let child = {
                let current = &path[path.len() - 1];
                let page = current.page();
                match page.tree()? {
                    PageContext::Leaf(_) => None,
                    PageContext::Branch(branch) => Some(branch.child_for(key).ok_or(
                        IndexOperationError::UnexpectedPageType {
                            page: current.page_id(),
                            expected: "branch with a low pointer",
                        },
                    )?),
                }
            };
            match child {
                Some(child) => path.push(self.fix_node(child, root, LatchMode::Exclusive)?),
                None => return Ok(path),
            }
        }
    }

    /// Descends along the low pointers to the first leaf.
    pub(crate) fn leftmost_leaf(&self, root: PageId, mode: LatchMode) -> IndexResult<PageGuard> {
        let mut guard = self.fix_node(root, root, LatchMode::Shared)?;
        loop {
            let step = {
                let page = guard.page();
                match page.tree()? {
                    PageContext::Leaf(_) => None,
                    PageContext::Branch(branch) => {
                        let child = branch
                            .low()
                            .or_else(|| branch.entries().first().map(|(_, child)| *child))
                            .ok_or(IndexOperationError::UnexpectedPageType {
                                page: guard.page_id(),
                                expected: "branch with children",
                            })?;
                        Some((child, branch.height()))
                    }
                }
            };
            match step {
                Some((child, height)) => {
                    let child_mode = if height == 1 { mode } else { LatchMode::Shared };
                    guard = self.fix_node(child, root, child_mode)?;
                }
                None if guard.mode() == mode => return Ok(guard),
                None => {
                    drop(guard);
                    guard = self.fix_node(root, root, mode)?;
                    let still_leaf = guard.page().leaf().is_ok();
                    if still_leaf {
                        return Ok(guard);
                    }
                    drop(guard);
                    guard = self.fix_node(root, root, LatchMode::Shared)?;
                }
            }
        }
    }

    // ===== Seeks =====

    /// The record with exactly `key`.
    pub(crate) fn seek_exact(
        &self,
        root: PageId,
        key: &DeweyId,
        mode: LatchMode,
    ) -> IndexResult<Option<(PageGuard, usize)>> {
        let guard = self.descend_leaf(root, key, mode)?;
        let slot = guard.page().leaf()?.search(key).ok();
        Ok(slot.map(|slot| (guard, slot)))
    }

    /// The first record with a key at or above `bound`.
    pub(crate) fn seek_at_least(
        &self,
        root: PageId,
        bound: &DeweyId,
        mode: LatchMode,
    ) -> IndexResult<Option<(PageGuard, usize)>> {
        let mut guard = self.descend_leaf(root, bound, mode)?;
        let mut slot = match guard.page().leaf()?.search(bound) {
            Ok(slot) | Err(slot) => slot,
        };
        loop {
            let (len, next) = {
                let page = guard.page();
                let leaf = page.leaf()?;
                (leaf.len(), leaf.next())
            };
            if slot < len {
                return Ok(Some((guard, slot)));
            }
            let Some(next) = next else {
                return Ok(None);
            };
            let from = guard.page_id();
            guard = self.fix_sibling(next, root, from, mode)?;
            slot = 0;
        }
    }

    /// The last record with a key below `bound`.
    ///
    /// Moving left uses a conditional latch; if the previous leaf is busy the
    /// current one is released first and the link rechecked afterwards.
    pub(crate) fn seek_before(
        &self,
        root: PageId,
        bound: &DeweyId,
        mode: LatchMode,
    ) -> IndexResult<Option<(PageGuard, usize)>> {
        'restart: loop {
            let mut guard = self.descend_leaf(root, bound, mode)?;
            let mut slot = match guard.page().leaf()?.search(bound) {
                Ok(slot) | Err(slot) => slot,
            };
            loop {
                if slot > 0 {
                    return Ok(Some((guard, slot - 1)));
                }
                let prev = guard.page().leaf()?.prev();
                let Some(prev) = prev else {
                    return Ok(None);
                };
                let current = guard.page_id();
                let left = match self.buffer.try_fix_page(prev, mode)? {
                    Some(left) => left,
                    None => {
                        drop(guard);
                        match self.buffer.fix_page(prev, mode) {
                            Ok(left) => left,
                            Err(err) if err.is_page_deleted() => continue 'restart,
                            Err(err) => return Err(err.into()),
                        }
                    }
                };
                let linked = {
                    let page = left.page();
                    match page.leaf() {
                        Ok(leaf) => leaf.root() == root && leaf.next() == Some(current),
                        Err(_) => false,
                    }
                };
                if !linked {
                    trace!(%root, page = %prev, "previous leaf changed, restarting");
                    std::thread::yield_now();
                    continue 'restart;
                }
                slot = left.page().leaf()?.len();
                guard = left;
            }
        }
    }

    /// Exact lookup that starts from a hint when it is still valid.
    pub(crate) fn seek_hinted(
        &self,
        root: PageId,
        key: &DeweyId,
        hint: &HintPageInformation,
        mode: LatchMode,
    ) -> IndexResult<Option<(PageGuard, usize)>> {
        let guard = match self.buffer.fix_page(hint.page, mode) {
            Ok(guard) => guard,
            Err(err) => {
                trace!(page = %hint.page, error = %err, "hint page unusable");
                return self.seek_exact(root, key, mode);
            }
        };
        let reuse = {
            let page = guard.page();
            match page.leaf() {
                Ok(leaf) if leaf.root() == root => {
                    let same_slot = page.lsn() == hint.lsn
                        && leaf.get(hint.slot).is_some_and(|record| &record.key == key);
                    if same_slot {
                        Some(Some(hint.slot))
                    } else if leaf.covers(key) {
                        Some(leaf.search(key).ok())
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };
        match reuse {
            Some(slot) => Ok(slot.map(|slot| (guard, slot))),
            None => {
                drop(guard);
                self.seek_exact(root, key, mode)
            }
        }
    }

    /// Walks the tree for a navigation mode starting at `key`.
    pub(crate) fn navigate(
        &self,
        root: PageId,
        mode: NavigationMode,
        key: &DeweyId,
        latch: LatchMode,
    ) -> IndexResult<Navigated> {
        let Some(plan) = mode.plan(key) else {
            return Ok(Navigated::Missing(NavigationStatus::NotExistent));
        };
        let (landed, miss) = match &plan.seek {
            Seek::Exact(target) => (
                self.seek_exact(root, target, latch)?,
                NavigationStatus::NotExistent,
            ),
            Seek::AtLeast(bound) => (
                self.seek_at_least(root, bound, latch)?,
                NavigationStatus::AfterLast,
            ),
            Seek::Before(bound) => (
                self.seek_before(root, bound, latch)?,
                NavigationStatus::BeforeFirst,
            ),
        };
        let Some((guard, slot)) = landed else {
            let status = if plan.accept == Accept::Any {
                miss
            } else {
                NavigationStatus::NotExistent
            };
            return Ok(Navigated::Missing(status));
        };

        let found = {
            let page = guard.page();
            let leaf = page.leaf()?;
            leaf.get(slot)
                .map(|record| record.key.clone())
                .ok_or(IndexOperationError::NotPositioned)?
        };
        match plan.accept.judge(&found) {
            Verdict::Accept => Ok(Navigated::Found(guard, slot)),
            Verdict::Reject => Ok(Navigated::Missing(NavigationStatus::NotExistent)),
            Verdict::Exact(target) => {
                drop(guard);
                Ok(match self.seek_exact(root, &target, latch)? {
                    Some((guard, slot)) => Navigated::Found(guard, slot),
                    None => Navigated::Missing(NavigationStatus::NotExistent),
                })
            }
        }
    }

    // ===== Records =====

    /// Reads one record.
    pub(crate) fn get(&self, root: PageId, key: &DeweyId) -> IndexResult<Option<NodeRecord>> {
        let guard = self.descend_leaf(root, key, LatchMode::Shared)?;
        let record = guard.page().leaf()?.find(key).cloned();
        Ok(record)
    }

    /// Value of a record, read from its blob chain if externalized.
    pub(crate) fn resolve_value(&self, record: &NodeRecord) -> IndexResult<Bytes> {
        match record.blob_page() {
            Some(blob) => Ok(self.blobs.read(blob)?),
            None => Ok(record.value.clone()),
        }
    }

    /// Values longer than this are stored in blob pages.
    pub(crate) fn externalize_threshold(&self, root: PageId) -> IndexResult<usize> {
        Ok(self.leaf_space(root)? / self.options.externalize_fraction.max(1))
    }

    fn leaf_space(&self, root: PageId) -> IndexResult<usize> {
        let block_size = self.buffer.block_size(root.container_id())?;
        Ok(Page::usable_leaf_space(block_size))
    }

    fn index_unit(&self, root: PageId) -> IndexResult<UnitId> {
        let guard = self.fix_node(root, root, LatchMode::Shared)?;
        let unit = guard.page().unit();
        Ok(unit)
    }

    /// Builds the stored form of a record, moving a long value to a blob.
    pub(crate) fn prepare_record(
        &self,
        tx: &Tx,
        root: PageId,
        key: &DeweyId,
        value: Bytes,
    ) -> IndexResult<NodeRecord> {
        let external = value.len() > self.externalize_threshold(root)?;
        let stored = if external { PageId::SIZE } else { value.len() };
        let len = key.encoded_len() + 1 + 4 + stored;
        let max = self.leaf_space(root)? / 3;
        if len > max {
            return Err(IndexOperationError::RecordTooLarge {
                key: key.clone(),
                len,
                max,
            });
        }
        if !external {
            return Ok(NodeRecord::new(key.clone(), value));
        }
        let unit = self.index_unit(root)?;
        let blob = self.blobs.store(tx, root.container_id(), unit, &value)?;
        trace!(%key, %blob, len = value.len(), "externalized value");
        Ok(NodeRecord::external(key.clone(), blob))
    }

    /// Releases the blob of a record that never made it into the tree.
    pub(crate) fn discard_prepared(&self, tx: &Tx, root: PageId, record: &NodeRecord) {
        let Some(blob) = record.blob_page() else {
            return;
        };
        let released = self
            .index_unit(root)
            .and_then(|unit| Ok(self.blobs.drop_now(tx, blob, unit)?));
        if let Err(err) = released {
            warn!(key = %record.key, %blob, error = %err, "could not release blob of failed record");
        }
    }

    /// Inserts one prepared record.
    pub(crate) fn insert(&self, tx: &Tx, root: PageId, record: NodeRecord) -> IndexResult<()> {
        for _ in 0..MAX_STRUCTURE_ROUNDS {
            let mut leaf = self.descend_leaf(root, &record.key, LatchMode::SharedIntention)?;
            match self.try_insert(tx, root, &mut leaf, &record)? {
                InsertOutcome::Inserted(_) => return Ok(()),
                InsertOutcome::NoSpace => {
                    drop(leaf);
                    self.make_room(tx, root, &record.key, record_len(&record))?;
                }
            }
        }
        Err(IndexOperationError::SplitFailed {
            root,
            key: record.key,
        })
    }

    /// Inserts into the latched leaf if there is room.
    pub(crate) fn try_insert(
        &self,
        tx: &Tx,
        root: PageId,
        leaf: &mut PageGuard,
        record: &NodeRecord,
    ) -> IndexResult<InsertOutcome> {
        let (slot, fits) = {
            let page = leaf.page();
            let slot = match page.leaf()?.search(&record.key) {
                Ok(_) => {
                    return Err(IndexOperationError::DuplicateKey {
                        root,
                        key: record.key.clone(),
                    })
                }
                Err(slot) => slot,
            };
            (slot, page.fits(record_len(record)))
        };
        if !fits {
            return Ok(InsertOutcome::NoSpace);
        }
        let page = leaf.page_id();
        self.log_change(
            tx,
            leaf,
            LogOperation::LeafInsert {
                page,
                root,
                record: record.clone(),
            },
        )?;
        Ok(InsertOutcome::Inserted(slot))
    }

    /// Inserts records with strictly increasing keys, one log record per leaf
    /// batch. Returns how many were inserted before an error, in the error
    /// case through `inserted`.
    pub(crate) fn insert_sequence(
        &self,
        tx: &Tx,
        root: PageId,
        records: &[NodeRecord],
        inserted: &mut usize,
    ) -> IndexResult<()> {
        let mut rounds = 0;
        while *inserted < records.len() {
            let first = &records[*inserted];
            let mut leaf = self.descend_leaf(root, &first.key, LatchMode::Exclusive)?;
            let batch = {
                let page = leaf.page();
                let content = page.leaf()?;
                let mut free = page.free_space();
                let mut batch = Vec::new();
                for record in &records[*inserted..] {
                    if content.high_key().is_some_and(|high| &record.key >= high) {
                        break;
                    }
                    let len = record_len(record);
                    if len > free {
                        break;
                    }
                    if content.search(&record.key).is_ok() {
                        return Err(IndexOperationError::DuplicateKey {
                            root,
                            key: record.key.clone(),
                        });
                    }
                    free -= len;
                    batch.push(record.clone());
                }
                batch
            };

            if batch.is_empty() {
                drop(leaf);
                rounds += 1;
                if rounds > MAX_STRUCTURE_ROUNDS {
                    return Err(IndexOperationError::SplitFailed {
                        root,
                        key: first.key.clone(),
                    });
                }
                self.make_room(tx, root, &first.key, record_len(first))?;
                continue;
            }

            let count = batch.len();
            let page = leaf.page_id();
            self.log_change(
                tx,
                &mut leaf,
                LogOperation::SequenceInsert {
                    page,
                    root,
                    records: batch,
                },
            )?;
            *inserted += count;
            rounds = 0;
        }
        Ok(())
    }

    /// Replaces the value of an existing record with a prepared one.
    pub(crate) fn update(&self, tx: &Tx, root: PageId, record: NodeRecord) -> IndexResult<()> {
        for _ in 0..MAX_STRUCTURE_ROUNDS {
            let mut leaf = self.descend_leaf(root, &record.key, LatchMode::SharedIntention)?;
            let (old, fits, unit) = {
                let page = leaf.page();
                let old = page.leaf()?.find(&record.key).cloned().ok_or_else(|| {
                    IndexOperationError::KeyNotFound {
                        root,
                        key: record.key.clone(),
                    }
                })?;
                let growth = record_len(&record).saturating_sub(record_len(&old));
                (old, page.fits(growth), page.unit())
            };
            if fits {
                let page = leaf.page_id();
                let old_blob = old.blob_page();
                self.log_change(
                    tx,
                    &mut leaf,
                    LogOperation::LeafUpdate {
                        page,
                        root,
                        old,
                        new: record,
                    },
                )?;
                if let Some(blob) = old_blob {
                    self.blobs.drop(tx, blob, unit);
                }
                return Ok(());
            }
            drop(leaf);
            let growth = record_len(&record).saturating_sub(record_len(&old));
            self.make_room(tx, root, &record.key, growth)?;
        }
        Err(IndexOperationError::SplitFailed {
            root,
            key: record.key,
        })
    }

    /// Deletes one record and returns it.
    pub(crate) fn delete(&self, tx: &Tx, root: PageId, key: &DeweyId) -> IndexResult<NodeRecord> {
        let mut leaf = self.descend_leaf(root, key, LatchMode::Exclusive)?;
        let (record, empties, unit) = {
            let page = leaf.page();
            let content = page.leaf()?;
            let record = content
                .find(key)
                .cloned()
                .ok_or_else(|| IndexOperationError::KeyNotFound {
                    root,
                    key: key.clone(),
                })?;
            (
                record,
                content.len() == 1 && content.next().is_some(),
                page.unit(),
            )
        };
        let page = leaf.page_id();
        self.log_change(
            tx,
            &mut leaf,
            LogOperation::LeafDelete {
                page,
                root,
                record: record.clone(),
            },
        )?;
        drop(leaf);

        if let Some(blob) = record.blob_page() {
            self.blobs.drop(tx, blob, unit);
        }
        if empties {
            self.unchain(tx, root, page, key)?;
        }
        Ok(record)
    }

    /// Deletes every record in `[from, to)` or `[from, to]`, one sequence
    /// delete per leaf. Returns the number of records deleted.
    pub(crate) fn delete_range(
        &self,
        tx: &Tx,
        root: PageId,
        from: &DeweyId,
        to: Bound<&DeweyId>,
    ) -> IndexResult<usize> {
        let mut deleted = 0;
        let mut start = from.clone();
        loop {
            let mut leaf = self.descend_leaf(root, &start, LatchMode::Exclusive)?;
            let (doomed, high, remains, has_next, unit) = {
                let page = leaf.page();
                let content = page.leaf()?;
                let doomed: Vec<NodeRecord> = content
                    .records()
                    .iter()
                    .filter(|record| record.key >= start && within(to, &record.key))
                    .cloned()
                    .collect();
                (
                    doomed,
                    content.high_key().cloned(),
                    content.len(),
                    content.next().is_some(),
                    page.unit(),
                )
            };

            let page = leaf.page_id();
            let count = doomed.len();
            if count > 0 {
                let blobs: Vec<PageId> = doomed.iter().filter_map(NodeRecord::blob_page).collect();
                self.log_change(
                    tx,
                    &mut leaf,
                    LogOperation::SequenceDelete {
                        page,
                        root,
                        records: doomed,
                    },
                )?;
                for blob in blobs {
                    self.blobs.drop(tx, blob, unit);
                }
                deleted += count;
            }
            drop(leaf);

            if count > 0 && count == remains && has_next {
                self.unchain(tx, root, page, &start)?;
            }
            match high {
                Some(high) if within(to, &high) => start = high,
                _ => break,
            }
        }
        trace!(txn = %tx.id(), %root, %from, deleted, "deleted range");
        Ok(deleted)
    }

    // ===== Structure modifications =====

    /// Makes room for `needed` bytes in the leaf for `key`, one split or root
    /// growth per call.
    fn make_room(&self, tx: &Tx, root: PageId, key: &DeweyId, needed: usize) -> IndexResult<()> {
        self.structure_modification(tx, || self.make_room_step(tx, root, key, needed))
    }

    fn make_room_step(&self, tx: &Tx, root: PageId, key: &DeweyId, needed: usize) -> IndexResult<()> {
        let mut path = self.descend_exclusive(root, key)?;
        let leaf_idx = path.len() - 1;
        if path[leaf_idx].page().fits(needed) {
            return Ok(());
        }

        // climb while the parent cannot take the separator
        let mut idx = leaf_idx;
        loop {
            if idx == 0 {
                return self.grow_root(tx, root, &mut path[0]);
            }
            let separator = self.separator_for(&path[idx], root, key)?;
            if path[idx - 1]
                .page()
                .fits(separator.encoded_len() + PageId::SIZE)
            {
                break;
            }
            idx -= 1;
        }

        let (upper, lower) = path.split_at_mut(idx);
        let parent = &mut upper[idx - 1];
        let node = &mut lower[0];
        if idx == leaf_idx {
            self.split_leaf(tx, root, parent, node, key)
        } else {
            self.split_branch(tx, root, parent, node)
        }
    }

    fn separator_for(&self, guard: &PageGuard, root: PageId, key: &DeweyId) -> IndexResult<DeweyId> {
        let page = guard.page();
        let separator = match page.tree()? {
            PageContext::Leaf(leaf) => {
                plan_leaf_split(leaf, key, page.free_space(), self.options.split_occupancy)
                    .map(|(_, sep)| sep)
            }
            PageContext::Branch(branch) => branch_split_slot(branch.entries())
                .map(|slot| branch.entries()[slot].0.clone()),
        };
        separator.ok_or_else(|| IndexOperationError::SplitFailed {
            root,
            key: key.clone(),
        })
    }

    fn split_leaf(
        &self,
        tx: &Tx,
        root: PageId,
        parent: &mut PageGuard,
        left: &mut PageGuard,
        key: &DeweyId,
    ) -> IndexResult<()> {
        let left_id = left.page_id();
        let (unit, separator, moved, old_high, old_next) = {
            let page = left.page();
            let leaf = page.leaf()?;
            let (slot, separator) =
                plan_leaf_split(leaf, key, page.free_space(), self.options.split_occupancy)
                    .ok_or_else(|| IndexOperationError::SplitFailed {
                    root,
                    key: key.clone(),
                })?;
            (
                page.unit(),
                separator,
                leaf.records()[slot..].to_vec(),
                leaf.high_key().cloned(),
                leaf.next(),
            )
        };

        let mut right = self.buffer.create_page(tx, left_id.container_id(), unit)?;
        let right_id = right.page_id();
        self.format(
            tx,
            &mut right,
            FormatState {
                kind: PageKind::Leaf,
                unit,
                root,
                height: 0,
            },
        )?;

        let moved_count = moved.len();
        if !moved.is_empty() {
            self.log_change(
                tx,
                &mut right,
                LogOperation::LeafSmoInsert {
                    page: right_id,
                    root,
                    records: moved.clone(),
                },
            )?;
            self.log_change(
                tx,
                left,
                LogOperation::LeafSmoDelete {
                    page: left_id,
                    root,
                    records: moved,
                },
            )?;
        }

        self.log_change(
            tx,
            &mut right,
            LogOperation::HighKeyUpdate {
                page: right_id,
                root,
                old: None,
                new: old_high.clone(),
            },
        )?;
        self.log_change(
            tx,
            left,
            LogOperation::HighKeyUpdate {
                page: left_id,
                root,
                old: old_high,
                new: Some(separator.clone()),
            },
        )?;

        self.set_pointer(tx, &mut right, root, PointerField::Previous, None, Some(left_id))?;
        self.set_pointer(tx, &mut right, root, PointerField::Next, None, old_next)?;
        if let Some(next) = old_next {
            let mut next_guard = self.fix_node(next, root, LatchMode::Exclusive)?;
            self.set_pointer(
                tx,
                &mut next_guard,
                root,
                PointerField::Previous,
                Some(left_id),
                Some(right_id),
            )?;
        }
        self.set_pointer(tx, left, root, PointerField::Next, old_next, Some(right_id))?;

        let parent_id = parent.page_id();
        self.log_change(
            tx,
            parent,
            LogOperation::BranchInsert {
                page: parent_id,
                root,
                key: separator.clone(),
                child: right_id,
            },
        )?;

        debug!(%root, left = %left_id, right = %right_id, %separator, moved = moved_count, "split leaf");
        Ok(())
    }

    fn split_branch(
        &self,
        tx: &Tx,
        root: PageId,
        parent: &mut PageGuard,
        left: &mut PageGuard,
    ) -> IndexResult<()> {
        let left_id = left.page_id();
        let (unit, height, entries, slot) = {
            let page = left.page();
            let branch = page.branch()?;
            let slot = branch_split_slot(branch.entries()).ok_or(
                IndexOperationError::UnexpectedPageType {
                    page: left_id,
                    expected: "branch with separators",
                },
            )?;
            (page.unit(), branch.height(), branch.entries().to_vec(), slot)
        };
        let (separator, separator_child) = entries[slot].clone();
        let moved = &entries[slot + 1..];

        let mut right = self.buffer.create_page(tx, left_id.container_id(), unit)?;
        let right_id = right.page_id();
        self.format(
            tx,
            &mut right,
            FormatState {
                kind: PageKind::Branch,
                unit,
                root,
                height,
            },
        )?;
        for (key, child) in moved {
            self.log_change(
                tx,
                &mut right,
                LogOperation::BranchInsert {
                    page: right_id,
                    root,
                    key: key.clone(),
                    child: *child,
                },
            )?;
        }
        self.set_pointer(tx, &mut right, root, PointerField::Low, None, Some(separator_child))?;

        for (key, child) in moved.iter().chain(std::iter::once(&entries[slot])) {
            self.log_change(
                tx,
                left,
                LogOperation::BranchDelete {
                    page: left_id,
                    root,
                    key: key.clone(),
                    child: *child,
                },
            )?;
        }

        let parent_id = parent.page_id();
        self.log_change(
            tx,
            parent,
            LogOperation::BranchInsert {
                page: parent_id,
                root,
                key: separator.clone(),
                child: right_id,
            },
        )?;

        debug!(%root, left = %left_id, right = %right_id, %separator, height, "split branch");
        Ok(())
    }

    /// Moves the root content into a new child and turns the root into a
    /// branch one level higher. The root keeps its page id.
    fn grow_root(&self, tx: &Tx, root: PageId, guard: &mut PageGuard) -> IndexResult<()> {
        let (unit, kind, height) = {
            let page = guard.page();
            let ctx = page.tree()?;
            (page.unit(), ctx.kind(), ctx.height())
        };

        let mut child = self.buffer.create_page(tx, root.container_id(), unit)?;
        let child_id = child.page_id();
        self.format(
            tx,
            &mut child,
            FormatState {
                kind,
                unit,
                root,
                height,
            },
        )?;

        match kind {
            PageKind::Leaf => {
                let content: LeafPage = guard.page().leaf()?.copy_content_and_context();
                let records = content.records().to_vec();
                if !records.is_empty() {
                    self.log_change(
                        tx,
                        &mut child,
                        LogOperation::LeafSmoInsert {
                            page: child_id,
                            root,
                            records: records.clone(),
                        },
                    )?;
                    self.log_change(
                        tx,
                        guard,
                        LogOperation::LeafSmoDelete {
                            page: root,
                            root,
                            records,
                        },
                    )?;
                }
            }
            PageKind::Branch => {
                let (low, entries) = {
                    let page = guard.page();
                    let branch = page.branch()?;
                    (branch.low(), branch.entries().to_vec())
                };
                for (key, grandchild) in &entries {
                    self.log_change(
                        tx,
                        &mut child,
                        LogOperation::BranchInsert {
                            page: child_id,
                            root,
                            key: key.clone(),
                            child: *grandchild,
                        },
                    )?;
                }
                self.set_pointer(tx, &mut child, root, PointerField::Low, None, low)?;
                for (key, grandchild) in &entries {
                    self.log_change(
                        tx,
                        guard,
                        LogOperation::BranchDelete {
                            page: root,
                            root,
                            key: key.clone(),
                            child: *grandchild,
                        },
                    )?;
                }
                self.set_pointer(tx, guard, root, PointerField::Low, low, None)?;
            }
        }

        self.format(
            tx,
            guard,
            FormatState {
                kind: PageKind::Branch,
                unit,
                root,
                height: height + 1,
            },
        )?;
        self.set_pointer(tx, guard, root, PointerField::Low, None, Some(child_id))?;

        debug!(%root, child = %child_id, height = height + 1, "grew root");
        Ok(())
    }

    /// Unlinks the empty leaf `leaf` from the chain and from its parent.
    ///
    /// `probe` is a key routed to the leaf. The leaf and any branch left
    /// without children are freed at commit.
    fn unchain(&self, tx: &Tx, root: PageId, leaf: PageId, probe: &DeweyId) -> IndexResult<()> {
        for _ in 0..MAX_UNCHAIN_ATTEMPTS {
            let outcome =
                self.structure_modification(tx, || self.try_unchain(tx, root, leaf, probe))?;
            match outcome {
                Unchain::Done | Unchain::Skipped => return Ok(()),
                Unchain::Busy => std::thread::yield_now(),
                Unchain::PrevFull { last, growth } => self.make_room(tx, root, &last, growth)?,
            }
        }
        debug!(%root, %leaf, "previous leaf stayed busy, empty leaf kept");
        Ok(())
    }

    fn try_unchain(
        &self,
        tx: &Tx,
        root: PageId,
        leaf: PageId,
        probe: &DeweyId,
    ) -> IndexResult<Unchain> {
        let mut path = self.descend_exclusive(root, probe)?;
        if path.len() < 2 {
            return Ok(Unchain::Skipped);
        }
        let leaf_idx = path.len() - 1;
        let (prev, next, high, unit) = {
            let guard = &path[leaf_idx];
            if guard.page_id() != leaf {
                return Ok(Unchain::Skipped);
            }
            let page = guard.page();
            let content = page.leaf()?;
            if !content.is_empty() {
                return Ok(Unchain::Skipped);
            }
            let Some(next) = content.next() else {
                return Ok(Unchain::Skipped);
            };
            (content.prev(), next, content.high_key().cloned(), page.unit())
        };

        let mut prev_guard = match prev {
            Some(prev) => match self.buffer.try_fix_page(prev, LatchMode::Exclusive)? {
                Some(guard) => Some(guard),
                None => return Ok(Unchain::Busy),
            },
            None => None,
        };
        let mut next_guard = self.fix_node(next, root, LatchMode::Exclusive)?;

        // lowest ancestor that keeps at least one child
        let Some(anchor) = (0..leaf_idx).rev().find(|&i| {
            path[i]
                .page()
                .branch()
                .is_ok_and(|branch| branch.child_count() >= 2)
        }) else {
            return Ok(Unchain::Skipped);
        };

        let anchor_id = path[anchor].page_id();
        let detached = path[anchor + 1].page_id();
        let (slot, entry, first) = {
            let page = path[anchor].page();
            let branch = page.branch()?;
            let slot = branch.slot_of(detached);
            let entry = match slot {
                Some(ChildSlot::Entry(i)) => branch.entries().get(i).cloned(),
                _ => None,
            };
            (slot, entry, branch.entries().first().cloned())
        };
        let missing = || IndexOperationError::from(PageError::corrupted(anchor_id, "child pointer missing"));

        // the left neighbor must have room for the longer high key
        if let (Some(ChildSlot::Entry(_)), Some(prev_guard), Some(high)) =
            (slot, prev_guard.as_ref(), high.as_ref())
        {
            let page = prev_guard.page();
            let content = page.leaf()?;
            let growth = high_key_growth(content.high_key(), high);
            if !page.fits(growth) {
                if content.len() < 2 {
                    debug!(%root, %leaf, prev = %prev_guard.page_id(), growth, "previous leaf full, empty leaf kept");
                    return Ok(Unchain::Skipped);
                }
                let last = content.records()[content.len() - 1].key.clone();
                return Ok(Unchain::PrevFull { last, growth });
            }
        }

        if let Some(prev_guard) = prev_guard.as_mut() {
            self.set_pointer(tx, prev_guard, root, PointerField::Next, Some(leaf), Some(next))?;
        }
        self.set_pointer(tx, &mut next_guard, root, PointerField::Previous, Some(leaf), prev)?;

        match slot {
            Some(ChildSlot::Low) => {
                let (key, child) = first.ok_or_else(missing)?;
                self.set_pointer(
                    tx,
                    &mut path[anchor],
                    root,
                    PointerField::Low,
                    Some(detached),
                    Some(child),
                )?;
                self.log_change(
                    tx,
                    &mut path[anchor],
                    LogOperation::BranchDelete {
                        page: anchor_id,
                        root,
                        key,
                        child,
                    },
                )?;
            }
            Some(ChildSlot::Entry(_)) => {
                let (key, child) = entry.ok_or_else(missing)?;
                self.log_change(
                    tx,
                    &mut path[anchor],
                    LogOperation::BranchDelete {
                        page: anchor_id,
                        root,
                        key,
                        child,
                    },
                )?;
                // the left neighbor takes over the key range
                let prev_guard = prev_guard.as_mut().ok_or_else(missing)?;
                let prev_id = prev_guard.page_id();
                let old_high = prev_guard.page().leaf()?.high_key().cloned();
                self.log_change(
                    tx,
                    prev_guard,
                    LogOperation::HighKeyUpdate {
                        page: prev_id,
                        root,
                        old: old_high,
                        new: high,
                    },
                )?;
            }
            None => return Err(missing()),
        }

        for guard in &path[anchor + 1..] {
            self.buffer.delete_page(tx, guard.page_id(), unit);
        }
        debug!(%root, %leaf, freed = leaf_idx - anchor, "unchained empty leaf");
        Ok(Unchain::Done)
    }

    // ===== Undo =====

    /// Logically undoes one record change, logging a compensation record
    /// with `undo_next`. A change that is already gone gets a dummy
    /// compensation record.
    pub(crate) fn compensate(
        &self,
        tx: &Tx,
        root: PageId,
        step: &Compensation,
        undo_next: Lsn,
    ) -> IndexResult<()> {
        match step {
            Compensation::Remove(record) => {
                let mut leaf = self.descend_leaf(root, &record.key, LatchMode::Exclusive)?;
                let found = {
                    let page = leaf.page();
                    let content = page.leaf()?;
                    content
                        .find(&record.key)
                        .cloned()
                        .map(|current| (current, content.len() == 1 && content.next().is_some()))
                };
                let Some((current, empties)) = found else {
                    return self.skip_compensation(tx, undo_next);
                };
                let page = leaf.page_id();
                self.apply_logged(
                    tx,
                    &mut leaf,
                    LogOperation::LeafDelete {
                        page,
                        root,
                        record: current,
                    },
                    LogAs::Compensation(undo_next),
                )?;
                drop(leaf);
                if empties {
                    self.unchain(tx, root, page, &record.key)?;
                }
                Ok(())
            }
            Compensation::Restore(record) | Compensation::Revert(record) => {
                let restore = matches!(step, Compensation::Restore(_));
                for _ in 0..MAX_STRUCTURE_ROUNDS {
                    let mut leaf = self.descend_leaf(root, &record.key, LatchMode::Exclusive)?;
                    let (current, fits) = {
                        let page = leaf.page();
                        let current = page.leaf()?.find(&record.key).cloned();
                        let present = current.as_ref().map_or(0, record_len);
                        let growth = record_len(record).saturating_sub(present);
                        (current, page.fits(growth))
                    };
                    let page = leaf.page_id();
                    let op = match (restore, current) {
                        (true, None) => LogOperation::LeafInsert {
                            page,
                            root,
                            record: record.clone(),
                        },
                        (false, Some(current)) if &current != record => LogOperation::LeafUpdate {
                            page,
                            root,
                            old: current,
                            new: record.clone(),
                        },
                        _ => return self.skip_compensation(tx, undo_next),
                    };
                    if fits {
                        self.apply_logged(tx, &mut leaf, op, LogAs::Compensation(undo_next))?;
                        return Ok(());
                    }
                    drop(leaf);
                    self.make_room(tx, root, &record.key, record_len(record))?;
                }
                Err(IndexOperationError::SplitFailed {
                    root,
                    key: record.key.clone(),
                })
            }
        }
    }

    fn skip_compensation(&self, tx: &Tx, undo_next: Lsn) -> IndexResult<()> {
        tx.log_clr(LogOperation::SmoEnd, undo_next)?;
        Ok(())
    }

    // ===== Diagnostics =====

    /// Checks the leaf chain: key order, high keys, back pointers, routing,
    /// and that only the last leaf may be empty.
    pub(crate) fn verify(&self, root: PageId) -> IndexResult<VerifyReport> {
        let mut guard = self.leftmost_leaf(root, LatchMode::Shared)?;
        let mut report = VerifyReport::default();
        let mut prev: Option<PageId> = None;
        let mut last_key: Option<DeweyId> = None;
        let mut low: Option<DeweyId> = None;
        let mut firsts = Vec::new();

        loop {
            let id = guard.page_id();
            let next = {
                let page = guard.page();
                let leaf = page.leaf()?;
                let corrupt = |reason: &str| IndexOperationError::from(PageError::corrupted(id, reason));
                if leaf.prev() != prev {
                    return Err(corrupt("previous pointer does not match the chain"));
                }
                for record in leaf.records() {
                    if last_key.as_ref().is_some_and(|last| last >= &record.key) {
                        return Err(corrupt("keys out of order across leaves"));
                    }
                    if low.as_ref().is_some_and(|low| &record.key < low) {
                        return Err(corrupt("key below the previous high key"));
                    }
                    if leaf.high_key().is_some_and(|high| &record.key >= high) {
                        return Err(corrupt("key at or above the high key"));
                    }
                    last_key = Some(record.key.clone());
                }
                if leaf.next().is_some() && leaf.is_empty() {
                    return Err(IndexOperationError::EmptyLeaf { page: id });
                }
                if leaf.next().is_none() && leaf.high_key().is_some() {
                    return Err(corrupt("last leaf has a high key"));
                }
                if let Some(first) = leaf.records().first() {
                    firsts.push((id, first.key.clone()));
                }
                report.leaves += 1;
                report.records += leaf.len();
                low = leaf.high_key().cloned();
                leaf.next()
            };
            match next {
                Some(next) => {
                    guard = self.fix_sibling(next, root, id, LatchMode::Shared)?;
                    prev = Some(id);
                }
                None => break,
            }
        }
        drop(guard);

        for (leaf, key) in firsts {
            let routed = self.descend_leaf(root, &key, LatchMode::Shared)?.page_id();
            if routed != leaf {
                return Err(PageError::corrupted(leaf, format!("key {key} is routed to {routed}")).into());
            }
        }
        Ok(report)
    }

    /// Writes every page, level by level, one line per page.
    pub(crate) fn dump(&self, root: PageId, out: &mut dyn fmt::Write) -> IndexResult<()> {
        let mut level = vec![root];
        while !level.is_empty() {
            let mut below = Vec::new();
            for id in level {
                let guard = self.fix_node(id, root, LatchMode::Shared)?;
                let page = guard.page();
                match page.tree()? {
                    PageContext::Leaf(leaf) => {
                        let keys: Vec<String> = leaf
                            .records()
                            .iter()
                            .map(|record| match record.blob_page() {
                                Some(blob) => format!("{}=>{blob}", record.key),
                                None => format!("{}({})", record.key, record.value.len()),
                            })
                            .collect();
                        writeln!(
                            out,
                            "{id} lsn={} leaf prev={} next={} high={} [{}]",
                            page.lsn(),
                            show(leaf.prev()),
                            show(leaf.next()),
                            leaf.high_key().map_or_else(|| "-".to_string(), ToString::to_string),
                            keys.join(", ")
                        )?;
                    }
                    PageContext::Branch(branch) => {
                        let entries: Vec<String> = branch
                            .entries()
                            .iter()
                            .map(|(key, child)| format!("{key}->{child}"))
                            .collect();
                        writeln!(
                            out,
                            "{id} lsn={} branch height={} low={} [{}]",
                            page.lsn(),
                            branch.height(),
                            show(branch.low()),
                            entries.join(", ")
                        )?;
                        below.extend(branch.low());
                        below.extend(branch.entries().iter().map(|(_, child)| *child));
                    }
                }
            }
            level = below;
        }
        Ok(())
    }
}

impl fmt::Debug for BracketTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BracketTree")
            .field("options", &self.options)
            .finish()
    }
}

// ===== Internal =====

fn within(bound: Bound<&DeweyId>, key: &DeweyId) -> bool {
    match bound {
        Bound::Included(upper) => key <= upper,
        Bound::Excluded(upper) => key < upper,
        Bound::Unbounded => true,
    }
}

fn show(page: Option<PageId>) -> String {
    page.map_or_else(|| "-".to_string(), |page| page.to_string())
}

/// Chooses where to split a leaf that cannot take `key`: the first slot of
/// the right page and the separator.
///
/// An insert behind the last record splits right there and leaves the new
/// page empty, provided the `room` left in the page takes the longer high
/// key. Otherwise the occupancy split point is moved off attribute keys,
/// which never become separators.
pub(crate) fn plan_leaf_split(
    leaf: &LeafPage,
    key: &DeweyId,
    room: usize,
    occupancy: f64,
) -> Option<(usize, DeweyId)> {
    let records = leaf.records();
    let n = records.len();
    let position = match leaf.search(key) {
        Ok(slot) | Err(slot) => slot,
    };
    if position == n
        && n > 0
        && !key.is_attribute()
        && high_key_growth(leaf.high_key(), key) <= room
    {
        return Some((n, key.clone()));
    }
    if n < 2 {
        return match records.first() {
            Some(first) if key < &first.key => Some((0, first.key.clone())),
            _ => None,
        };
    }

    let mut slot = leaf.split_slot(occupancy).clamp(1, n - 1);
    while slot > 1 && records[slot].key.is_attribute() {
        slot -= 1;
    }
    while slot < n - 1 && records[slot].key.is_attribute() {
        slot += 1;
    }
    Some((slot, records[slot].key.clone()))
}

/// Extra bytes a leaf needs when its high key becomes `new`.
pub(crate) fn high_key_growth(old: Option<&DeweyId>, new: &DeweyId) -> usize {
    new.encoded_len()
        .saturating_sub(old.map_or(0, DeweyId::encoded_len))
}

/// Separator slot that splits a branch in the middle of its bytes.
fn branch_split_slot(entries: &[(DeweyId, PageId)]) -> Option<usize> {
    if entries.is_empty() {
        return None;
    }
    let total: usize = entries
        .iter()
        .map(|(key, _)| key.encoded_len() + PageId::SIZE)
        .sum();
    let mut acc = 0;
    for (slot, (key, _)) in entries.iter().enumerate() {
        acc += key.encoded_len() + PageId::SIZE;
        if acc * 2 >= total {
            return Some(slot);
        }
    }
    Some(entries.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bracket_wal::LogManager;

    fn key(s: &str) -> DeweyId {
        s.parse().unwrap()
    }

    fn leaf_with(keys: &[&str]) -> LeafPage {
        let id = PageId::new(1, 3);
        let mut leaf = LeafPage::new(PageId::new(1, 2));
        for k in keys {
            leaf.insert(id, NodeRecord::new(key(k), &b"0123456789"[..]))
                .unwrap();
        }
        leaf
    }

    #[test]
    fn test_split_behind_last_record_leaves_right_empty() {
        let leaf = leaf_with(&["1.1", "1.2", "1.3"]);
        assert_eq!(
            plan_leaf_split(&leaf, &key("1.4"), 64, 0.5),
            Some((3, key("1.4")))
        );
    }

    #[test]
    fn test_occupancy_split_avoids_attributes() {
        let leaf = leaf_with(&["1", "1.0.1", "1.0.2", "1.1", "1.2"]);
        let (slot, separator) = plan_leaf_split(&leaf, &key("1.0.3"), 64, 0.5).unwrap();
        assert!(!separator.is_attribute());
        assert_eq!(leaf.records()[slot].key, separator);
        assert!(slot >= 1 && slot < 5);
    }

    #[test]
    fn test_single_record_split() {
        let leaf = leaf_with(&["1.5"]);
        assert_eq!(plan_leaf_split(&leaf, &key("1.2"), 64, 0.5), Some((0, key("1.5"))));
        assert_eq!(plan_leaf_split(&leaf, &key("1.5.0.1"), 64, 0.5), None);
    }

    #[test]
    fn test_branch_split_slot_middle() {
        let child = PageId::new(1, 9);
        let entries: Vec<_> = ["1.2", "1.4", "1.6", "1.8"]
            .iter()
            .map(|k| (key(k), child))
            .collect();
        assert_eq!(branch_split_slot(&entries), Some(1));
        assert_eq!(branch_split_slot(&entries[..1]), Some(0));
        assert_eq!(branch_split_slot(&[]), None);
    }

    #[test]
    fn test_within() {
        let upper = key("1.5");
        assert!(within(Bound::Included(&upper), &key("1.5")));
        assert!(!within(Bound::Excluded(&upper), &key("1.5")));
        assert!(within(Bound::Unbounded, &key("9")));
    }

    #[test]
    fn test_apply_logged_restores_page_when_logging_fails() {
        use crate::space::{BlockSpace, ContainerRegistry};
        use bracket_common::types::TxnId;

        let dir = tempfile::tempdir().unwrap();
        let container = ContainerId::new(1);
        let space = Arc::new(BlockSpace::new(dir.path(), container));
        space.create(512, 8, 1.0).unwrap();
        space.open().unwrap();
        let registry = Arc::new(ContainerRegistry::new());
        registry.register(space).unwrap();
        let log = Arc::new(LogManager::in_memory());
        let buffer = Arc::new(BufferManager::new(registry, Arc::clone(&log), 16));
        let tree = BracketTree::new(
            Arc::clone(&buffer),
            TreeOptions {
                split_occupancy: 0.5,
                externalize_fraction: 6,
            },
        );

        let tx = Tx::new(TxnId::new(1), Arc::clone(&log));
        let root = tree.create_index(&tx, container, None).unwrap();
        let mut guard = tree.fix_node(root, root, LatchMode::Exclusive).unwrap();
        let before = guard.page().clone();

        tx.set_state(TxState::Committed);
        let op = LogOperation::LeafInsert {
            page: root,
            root,
            record: NodeRecord::new(key("1"), &b"x"[..]),
        };
        assert!(tree.apply_logged(&tx, &mut guard, op, LogAs::Update).is_err());
        assert_eq!(*guard.page(), before);
    }
}
