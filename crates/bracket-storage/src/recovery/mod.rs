//! Transactions and crash recovery.
//!
//! ```text
//!   forward        Tx ──► log_update ──► page change, LSN stamped
//!   commit         Commit record, log forced, queued cleanup runs once
//!   rollback       undo newest first, one CLR per undone step, Abort record
//!
//!   restart        analysis ──► redo (repeat history) ──► undo losers
//! ```
//!
//! Record changes are undone logically through the tree. Everything a
//! completed structure modification logged is skipped by rollback, because
//! the modification ends with a compensation record pointing before it.

mod apply;
mod manager;
mod restart;

pub use manager::TxManager;
pub use restart::RestartReport;
