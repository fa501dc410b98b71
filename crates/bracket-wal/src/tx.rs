//! Transaction log context.
//!
//! A [`Tx`] threads the per-transaction undo chain through the log: every
//! record it writes points back at the previous one (`prev_lsn`). It also
//! carries the queue of cleanup actions that may only run after commit
//! (dropping externalized values, freeing unchained pages, dropping units).
//!
//! Structure modifications run as nested top actions:
//!
//! ```text
//!   saved = tx.begin_structure_modification()
//!   ... log split / unchain records ...
//!   tx.end_structure_modification(saved)   // CLR, undo_next = saved
//! ```
//!
//! Rollback follows `undo_next` of the closing CLR and so skips the whole
//! modification, while redo still replays it.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use bracket_common::types::{ContainerId, Lsn, PageId, TxnId, UnitId};

use crate::error::{LogError, LogResult};
use crate::log::LogManager;
use crate::record::{LogOperation, LogRecord};

/// Transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting work.
    Running,
    /// Failed; only rollback is allowed.
    Aborted,
    /// Rolling back.
    Rollback,
    /// Committed.
    Committed,
    /// Rolled back.
    RolledBack,
}

impl TxState {
    /// Returns the state name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Aborted => "aborted",
            Self::Rollback => "rollback",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        }
    }

    /// Returns true if the transaction may still log work.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Aborted | Self::Rollback)
    }

    /// Returns true if the transaction may commit.
    pub const fn is_commitable(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Returns true if the transaction may roll back.
    pub const fn is_rollbackable(self) -> bool {
        matches!(self, Self::Running | Self::Aborted)
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cleanup action that runs exactly once after commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    /// Drop an externalized value chain.
    DropBlob {
        /// First page of the chain.
        page: PageId,
        /// Owning unit.
        unit: UnitId,
    },
    /// Return an unchained page to the allocator.
    FreePage {
        /// The page.
        page: PageId,
        /// Owning unit.
        unit: UnitId,
    },
    /// Drop a whole unit.
    DropUnit {
        /// Container of the unit.
        container: ContainerId,
        /// The unit.
        unit: UnitId,
    },
}

struct TxInner {
    state: TxState,
    first_lsn: Lsn,
    last_lsn: Lsn,
    pending: Vec<PendingAction>,
}

/// Per-transaction log context.
pub struct Tx {
    id: TxnId,
    log: Arc<LogManager>,
    inner: Mutex<TxInner>,
}

impl Tx {
    /// Creates a running transaction.
    pub fn new(id: TxnId, log: Arc<LogManager>) -> Self {
        Self {
            id,
            log,
            inner: Mutex::new(TxInner {
                state: TxState::Running,
                first_lsn: Lsn::INVALID,
                last_lsn: Lsn::INVALID,
                pending: Vec::new(),
            }),
        }
    }

    /// Resumes a transaction found in the log during restart.
    pub fn resume(id: TxnId, log: Arc<LogManager>, last_lsn: Lsn) -> Self {
        let tx = Self::new(id, log);
        {
            let mut inner = tx.inner.lock();
            inner.state = TxState::Aborted;
            inner.last_lsn = last_lsn;
        }
        tx
    }

    /// Returns the transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Returns the log this transaction writes to.
    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    /// Returns the current state.
    pub fn state(&self) -> TxState {
        self.inner.lock().state
    }

    /// Sets the state.
    pub fn set_state(&self, state: TxState) {
        let mut inner = self.inner.lock();
        trace!(txn = %self.id, from = %inner.state, to = %state, "transaction state change");
        inner.state = state;
    }

    /// LSN of the first record this transaction wrote.
    pub fn first_lsn(&self) -> Lsn {
        self.inner.lock().first_lsn
    }

    /// LSN of the last record this transaction wrote.
    pub fn last_lsn(&self) -> Lsn {
        self.inner.lock().last_lsn
    }

    /// Logs an undoable update.
    ///
    /// Also allowed while rolling back, where structure modifications that
    /// undo triggers are logged as ordinary updates inside a nested top action.
    pub fn log_update(&self, op: LogOperation) -> LogResult<Lsn> {
        self.append(
            |prev| LogRecord::update(Lsn::INVALID, prev, self.id, op),
            TxState::is_active,
        )
    }

    /// Logs a redo-only record.
    pub fn log_redo_only(&self, op: LogOperation) -> LogResult<Lsn> {
        self.append(
            |prev| LogRecord::redo_only(Lsn::INVALID, prev, self.id, op),
            TxState::is_active,
        )
    }

    /// Logs a compensation record. `undo_next` is the next record to undo.
    pub fn log_clr(&self, op: LogOperation, undo_next: Lsn) -> LogResult<Lsn> {
        self.append(
            |prev| LogRecord::clr(Lsn::INVALID, prev, self.id, undo_next, op),
            TxState::is_active,
        )
    }

    fn append(
        &self,
        build: impl FnOnce(Lsn) -> LogRecord,
        allowed: impl FnOnce(TxState) -> bool,
    ) -> LogResult<Lsn> {
        let mut inner = self.inner.lock();
        if !allowed(inner.state) {
            return Err(LogError::InvalidState {
                txn_id: self.id,
                state: inner.state.as_str(),
            });
        }
        let lsn = self.log.append(build(inner.last_lsn))?;
        if !inner.first_lsn.is_valid() {
            inner.first_lsn = lsn;
        }
        inner.last_lsn = lsn;
        Ok(lsn)
    }

    /// Starts a nested top action. Returns the LSN to resume undo at.
    pub fn begin_structure_modification(&self) -> Lsn {
        self.last_lsn()
    }

    /// Ends a nested top action started at `saved`.
    pub fn end_structure_modification(&self, saved: Lsn) -> LogResult<Lsn> {
        self.log_clr(LogOperation::SmoEnd, saved)
    }

    /// Queues a post-commit action.
    pub fn add_pending(&self, action: PendingAction) {
        self.inner.lock().pending.push(action);
    }

    /// Removes and returns every queued action.
    pub fn take_pending(&self) -> Vec<PendingAction> {
        std::mem::take(&mut self.inner.lock().pending)
    }

    /// Drops every queued action. Returns how many were dropped.
    pub fn discard_pending(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.pending.len();
        inner.pending.clear();
        count
    }

    /// Number of queued actions.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

impl fmt::Debug for Tx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Tx")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("last_lsn", &inner.last_lsn)
            .field("pending", &inner.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx() -> Tx {
        Tx::new(TxnId::new(1), Arc::new(LogManager::in_memory()))
    }

    fn allocate(block: u32) -> LogOperation {
        LogOperation::Allocate {
            page: PageId::new(1, block),
            unit: UnitId::new(1),
        }
    }

    #[test]
    fn test_undo_chain() {
        let tx = tx();
        let first = tx.log_update(allocate(1)).unwrap();
        let second = tx.log_update(allocate(2)).unwrap();

        let record = tx.log().get(second).unwrap();
        assert_eq!(record.prev_lsn, first);
        assert_eq!(tx.first_lsn(), first);
        assert_eq!(tx.last_lsn(), second);
    }

    #[test]
    fn test_structure_modification_clr() {
        let tx = tx();
        let before = tx.log_update(allocate(1)).unwrap();
        let saved = tx.begin_structure_modification();
        tx.log_update(allocate(2)).unwrap();
        let end = tx.end_structure_modification(saved).unwrap();

        let record = tx.log().get(end).unwrap();
        assert!(record.is_clr());
        assert_eq!(record.undo_next, before);
        assert_eq!(record.op, LogOperation::SmoEnd);
    }

    #[test]
    fn test_state_guards_logging() {
        let tx = tx();
        tx.set_state(TxState::Rollback);
        assert!(tx.log_update(allocate(1)).is_ok());
        assert!(tx.log_clr(allocate(1), Lsn::INVALID).is_ok());

        tx.set_state(TxState::RolledBack);
        assert!(tx.log_update(allocate(2)).is_err());

        tx.set_state(TxState::Committed);
        let err = tx.log_redo_only(LogOperation::Commit).unwrap_err();
        assert!(matches!(err, LogError::InvalidState { state: "committed", .. }));
    }

    #[test]
    fn test_pending_queue_drains_once() {
        let tx = tx();
        tx.add_pending(PendingAction::FreePage {
            page: PageId::new(1, 4),
            unit: UnitId::new(1),
        });
        tx.add_pending(PendingAction::DropUnit {
            container: ContainerId::new(1),
            unit: UnitId::new(2),
        });
        assert_eq!(tx.pending_count(), 2);
        assert_eq!(tx.take_pending().len(), 2);
        assert!(tx.take_pending().is_empty());

        tx.add_pending(PendingAction::DropBlob {
            page: PageId::new(1, 9),
            unit: UnitId::new(1),
        });
        assert_eq!(tx.discard_pending(), 1);
        assert_eq!(tx.pending_count(), 0);
    }

    #[test]
    fn test_resume_is_aborted() {
        let log = Arc::new(LogManager::in_memory());
        let tx = Tx::resume(TxnId::new(9), log, Lsn::new(12));
        assert_eq!(tx.state(), TxState::Aborted);
        assert_eq!(tx.last_lsn(), Lsn::new(12));
        assert!(tx.state().is_rollbackable());
    }
}
