//! Restart recovery: analysis, redo, undo.

use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::sync::Arc;

use tracing::{debug, error, info};

use bracket_common::types::{Lsn, TxnId};
use bracket_wal::{LogOperation, Tx, TxState};

use super::apply;
use super::manager::{chained, undo_step, TxManager};
use crate::index::IndexResult;

/// What a restart found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartReport {
    /// Log records scanned.
    pub records: usize,
    /// Records whose effect had to be repeated.
    pub redone: usize,
    /// Transactions without a commit or abort record, in id order.
    pub losers: Vec<TxnId>,
    /// Records undone for the losers.
    pub undone: usize,
}

impl TxManager {
    /// Brings pages and allocators up to date with the log, then rolls back
    /// every transaction that neither committed nor aborted.
    ///
    /// Redo repeats history, compensation records included. Undo processes
    /// all losers together, newest record first, and resumes each one at the
    /// undo-next LSN of its last compensation record.
    pub fn restart(&self) -> IndexResult<RestartReport> {
        let log = Arc::clone(self.buffer().log());
        let records = log.records();
        let mut report = RestartReport {
            records: records.len(),
            ..RestartReport::default()
        };

        // analysis
        let mut last: BTreeMap<TxnId, Lsn> = BTreeMap::new();
        let mut finished: HashSet<TxnId> = HashSet::new();
        for record in &records {
            self.observe_txn(record.txn_id);
            match record.op {
                LogOperation::Commit | LogOperation::Abort => {
                    finished.insert(record.txn_id);
                    last.remove(&record.txn_id);
                }
                _ if finished.contains(&record.txn_id) => {}
                _ => {
                    last.insert(record.txn_id, record.lsn);
                }
            }
        }
        report.losers = last.keys().copied().collect();
        debug!(records = report.records, losers = report.losers.len(), "analysis done");

        // redo
        for record in &records {
            if apply::redo(self.buffer(), record).map_err(|err| chained("redo", record, err))? {
                report.redone += 1;
            }
        }
        debug!(redone = report.redone, "redo done");

        // undo
        let losers: Vec<Tx> = last
            .iter()
            .map(|(id, lsn)| Tx::resume(*id, Arc::clone(&log), *lsn))
            .collect();
        let mut heap: BinaryHeap<(Lsn, usize)> = BinaryHeap::new();
        for (i, tx) in losers.iter().enumerate() {
            tx.set_state(TxState::Rollback);
            heap.push((tx.last_lsn(), i));
        }
        while let Some((lsn, i)) = heap.pop() {
            let tx = &losers[i];
            let record = log.get(lsn)?;
            let next = match undo_step(self.index().tree(), tx, &record, &mut report.undone) {
                Ok(next) => next,
                Err(err) => {
                    error!(txn = %tx.id(), %lsn, error = %err, unrecoverable = err.is_unrecoverable(), "restart undo failed");
                    return Err(err);
                }
            };
            if next.is_valid() {
                heap.push((next, i));
            } else {
                self.finish_rollback(tx)?;
            }
        }

        self.buffer().flush_all()?;
        log.flush_all()?;
        info!(
            records = report.records,
            redone = report.redone,
            losers = report.losers.len(),
            undone = report.undone,
            "restart complete"
        );
        Ok(report)
    }
}
