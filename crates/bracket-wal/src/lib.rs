//! # bracket-wal
//!
//! Write-ahead logging for BracketDB.
//!
//! This crate provides:
//! - Typed log operations with a 1-byte tag binary codec
//! - The log manager (LSN assignment, buffered append, forced flush,
//!   torn-tail truncation on open)
//! - The per-transaction log context with its undo chain, compensation
//!   records, nested top actions and post-commit cleanup queue
//!
//! Applying operations to pages (redo/undo) lives with the pages, in
//! `bracket-storage`.
//!
//! ## Record Format
//!
//! ```text
//! +---------+----------+-----------+--------------+-------+----------+--------+----------+
//! | LSN (8) | Prev (8) | TxnId (8) | UndoNext (8) | Flags | Reserved | Length | Checksum |
//! +---------+----------+-----------+--------------+-------+----------+--------+----------+
//! |                          Operation: tag (1) + payload                                |
//! +--------------------------------------------------------------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
mod error;

/// Log record types and serialization.
pub mod record;

/// The log manager.
pub mod log;

/// Transaction log context.
pub mod tx;

pub use config::LogConfig;
pub use error::{LogError, LogResult};
pub use log::{LogManager, LogStats};
pub use record::{
    FormatState, LogOperation, LogRecord, OperationType, PointerField, RecordFlags,
};
pub use tx::{PendingAction, Tx, TxState};
