//! Transaction manager: begin, commit and rollback.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, warn};

use bracket_common::types::{Lsn, TxnId};
use bracket_wal::{LogError, LogOperation, LogRecord, PendingAction, Tx, TxState};

use super::apply::{self, DeferredReleases};
use crate::buffer::BufferManager;
use crate::index::{BracketIndex, BracketTree, IndexOperationError, IndexResult};

/// Starts and ends transactions over one buffer and index layer.
///
/// Commit forces the log and then runs the transaction's queued cleanup
/// exactly once. Rollback undoes the transaction's records newest first and
/// throws away queued blob and unit drops.
pub struct TxManager {
    buffer: Arc<BufferManager>,
    index: BracketIndex,
    next_txn: AtomicU64,
}

impl TxManager {
    /// Creates a transaction manager.
    pub fn new(buffer: Arc<BufferManager>, index: BracketIndex) -> Self {
        Self {
            buffer,
            index,
            next_txn: AtomicU64::new(1),
        }
    }

    /// The index layer transactions work on.
    pub fn index(&self) -> &BracketIndex {
        &self.index
    }

    /// The buffer manager.
    pub fn buffer(&self) -> &Arc<BufferManager> {
        &self.buffer
    }

    /// Starts a transaction.
    pub fn begin(&self) -> Tx {
        let id = TxnId::new(self.next_txn.fetch_add(1, Ordering::SeqCst));
        debug!(txn = %id, "begin");
        Tx::new(id, Arc::clone(self.buffer.log()))
    }

    /// Commits `tx`.
    ///
    /// Once the commit record is durable the transaction counts as
    /// committed; a failing cleanup afterwards only leaks space and is
    /// reported through `warn!`.
    pub fn commit(&self, tx: &Tx) -> IndexResult<()> {
        let state = tx.state();
        if !state.is_commitable() {
            return Err(LogError::InvalidState {
                txn_id: tx.id(),
                state: state.as_str(),
            }
            .into());
        }
        let lsn = tx.log_redo_only(LogOperation::Commit)?;
        self.buffer.log().flush(lsn)?;

        let cleanup = self.run_pending(tx);
        tx.set_state(TxState::Committed);
        if let Err(err) = cleanup {
            warn!(txn = %tx.id(), error = %err, "post-commit cleanup failed");
        }
        debug!(txn = %tx.id(), %lsn, "committed");
        Ok(())
    }

    /// Rolls `tx` back. Returns the number of records undone.
    pub fn rollback(&self, tx: &Tx) -> IndexResult<usize> {
        let state = tx.state();
        if !state.is_rollbackable() {
            return Err(LogError::InvalidState {
                txn_id: tx.id(),
                state: state.as_str(),
            }
            .into());
        }
        tx.set_state(TxState::Rollback);
        let discarded = discard_reversible(tx);

        let undone = match undo_chain(self.index.tree(), tx, tx.last_lsn()) {
            Ok(undone) => undone,
            Err(err) => {
                error!(txn = %tx.id(), error = %err, "rollback failed");
                return Err(err);
            }
        };
        self.finish_rollback(tx)?;
        debug!(txn = %tx.id(), undone, discarded, "rolled back");
        Ok(undone)
    }

    // ===== Internal =====

    /// Makes sure transaction ids handed out later are above `id`.
    pub(crate) fn observe_txn(&self, id: TxnId) {
        self.next_txn.fetch_max(id.as_u64() + 1, Ordering::SeqCst);
    }

    /// Logs the abort and frees pages that undo itself unchained.
    pub(crate) fn finish_rollback(&self, tx: &Tx) -> IndexResult<()> {
        tx.log_redo_only(LogOperation::Abort)?;
        if let Err(err) = self.run_pending(tx) {
            warn!(txn = %tx.id(), error = %err, "cleanup after rollback failed");
        }
        tx.set_state(TxState::RolledBack);
        Ok(())
    }

    /// Runs the queued cleanup: blob chains first, then one deferred
    /// deallocation record per container.
    fn run_pending(&self, tx: &Tx) -> IndexResult<()> {
        let actions = tx.take_pending();
        if actions.is_empty() {
            return Ok(());
        }

        let mut releases = DeferredReleases::new();
        for action in &actions {
            if let PendingAction::DropBlob { page, unit } = *action {
                let chain = self.index.tree().blobs().chain_pages(page)?;
                releases
                    .entry(page.container_id())
                    .or_default()
                    .0
                    .extend(chain.into_iter().map(|link| (link, unit)));
            }
        }
        for action in actions {
            match action {
                PendingAction::DropBlob { .. } => {}
                PendingAction::FreePage { page, unit } => releases
                    .entry(page.container_id())
                    .or_default()
                    .0
                    .push((page, unit)),
                PendingAction::DropUnit { container, unit } => {
                    releases.entry(container).or_default().1.push(unit)
                }
            }
        }

        for (container, (mut pages, mut units)) in releases {
            pages.sort_unstable_by_key(|entry| entry.0);
            pages.dedup_by_key(|entry| entry.0);
            units.sort_unstable();
            units.dedup();

            let lsn = tx.log_redo_only(LogOperation::DeallocateDeferred {
                container,
                pages: pages.clone(),
                units: units.clone(),
            })?;
            self.buffer.log().flush(lsn)?;
            apply::release_deferred(&self.buffer, container, &pages, &units, false)?;
            debug!(txn = %tx.id(), %container, pages = pages.len(), units = units.len(), "released deferred");
        }
        Ok(())
    }
}

impl fmt::Debug for TxManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxManager")
            .field("next_txn", &self.next_txn.load(Ordering::Relaxed))
            .finish()
    }
}

/// Drops queued cleanup that undo makes obsolete. Frees of pages that
/// completed structure modifications detached stay queued, since those
/// modifications are never undone.
fn discard_reversible(tx: &Tx) -> usize {
    let mut discarded = 0;
    for action in tx.take_pending() {
        match action {
            PendingAction::FreePage { .. } => tx.add_pending(action),
            PendingAction::DropBlob { .. } | PendingAction::DropUnit { .. } => discarded += 1,
        }
    }
    discarded
}

/// Undoes the records of `tx` starting at `from`, following compensation
/// records past work that was already undone.
pub(crate) fn undo_chain(tree: &BracketTree, tx: &Tx, from: Lsn) -> IndexResult<usize> {
    let log = Arc::clone(tx.log());
    let mut next = from;
    let mut undone = 0;
    while next.is_valid() {
        let record = log.get(next)?;
        next = undo_step(tree, tx, &record, &mut undone)?;
    }
    Ok(undone)
}

/// Undoes one record if it needs undoing and returns the next LSN to visit.
pub(crate) fn undo_step(
    tree: &BracketTree,
    tx: &Tx,
    record: &LogRecord,
    undone: &mut usize,
) -> IndexResult<Lsn> {
    if record.is_clr() {
        return Ok(record.undo_next);
    }
    if record.is_undoable() {
        apply::undo(tree, tx, record).map_err(|err| chained("undo", record, err))?;
        *undone += 1;
    }
    Ok(record.prev_lsn)
}

/// Wraps a failure with the record it happened on. Access faults stay as
/// they are so their recoverability can still be inspected.
pub(crate) fn chained(
    action: &'static str,
    record: &LogRecord,
    err: IndexOperationError,
) -> IndexOperationError {
    match err {
        IndexOperationError::Access(_) => err,
        other if action == "redo" => LogError::redo(&record.op, other).into(),
        other => LogError::undo(&record.op, other).into(),
    }
}
