//! Log error types.
//!
//! This module defines all error types for log operations and the log manager.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use bracket_common::error::{BoxError, DbError, ErrorCode};
use bracket_common::types::{DeweyIdError, Lsn, TxnId};

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors that can occur while encoding, decoding or applying log operations.
#[derive(Debug, Error)]
pub enum LogError {
    /// I/O error on the log file.
    #[error("log I/O error: {source}")]
    Io {
        /// Underlying I/O error.
        #[from]
        source: io::Error,
    },

    /// Log directory does not exist.
    #[error("log directory does not exist: {path}")]
    DirectoryNotFound {
        /// Missing directory.
        path: PathBuf,
    },

    /// The 1-byte operation tag is not known.
    #[error("unknown log operation type: {tag}")]
    UnknownOperation {
        /// The offending tag.
        tag: u8,
    },

    /// A payload ended before all of its fields were read.
    #[error("truncated {what}: need {needed} bytes, have {available}")]
    Truncated {
        /// What was being decoded.
        what: &'static str,
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },

    /// A key inside a payload could not be decoded.
    #[error("invalid key in log payload: {0}")]
    InvalidKey(#[from] DeweyIdError),

    /// Record checksum mismatch.
    #[error("log record checksum mismatch at LSN {lsn}: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        /// LSN of the damaged record.
        lsn: Lsn,
        /// Stored checksum.
        expected: u32,
        /// Recomputed checksum.
        computed: u32,
    },

    /// The requested LSN is not in the log.
    #[error("LSN {lsn} not found in the log")]
    LsnNotFound {
        /// Requested LSN.
        lsn: Lsn,
    },

    /// A transaction attempted to log in a state that forbids it.
    #[error("transaction {txn_id} cannot log in state {state}")]
    InvalidState {
        /// The transaction.
        txn_id: TxnId,
        /// Current state name.
        state: &'static str,
    },

    /// Applying an operation (redo or undo) failed; the cause is chained.
    #[error("{action} of {operation} failed: {source}")]
    Apply {
        /// "redo" or "undo".
        action: &'static str,
        /// Operation description.
        operation: String,
        /// Chained cause.
        #[source]
        source: BoxError,
    },

    /// Log is closed.
    #[error("log is closed")]
    Closed,

    /// Configuration error.
    #[error("log configuration error: {reason}")]
    ConfigError {
        /// Description of the problem.
        reason: String,
    },
}

impl LogError {
    /// Creates an unknown-operation error.
    pub fn unknown_operation(tag: u8) -> Self {
        Self::UnknownOperation { tag }
    }

    /// Creates a truncation error.
    pub fn truncated(what: &'static str, needed: usize, available: usize) -> Self {
        Self::Truncated {
            what,
            needed,
            available,
        }
    }

    /// Creates a checksum mismatch error.
    pub fn checksum_mismatch(lsn: Lsn, expected: u32, computed: u32) -> Self {
        Self::ChecksumMismatch {
            lsn,
            expected,
            computed,
        }
    }

    /// Wraps a redo failure.
    pub fn redo(operation: impl ToString, source: impl Into<BoxError>) -> Self {
        Self::Apply {
            action: "redo",
            operation: operation.to_string(),
            source: source.into(),
        }
    }

    /// Wraps an undo failure.
    pub fn undo(operation: impl ToString, source: impl Into<BoxError>) -> Self {
        Self::Apply {
            action: "undo",
            operation: operation.to_string(),
            source: source.into(),
        }
    }

    /// Creates a config error.
    pub fn config_error(reason: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
        }
    }

    /// Returns true if this is a decode-time error.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownOperation { .. } | Self::Truncated { .. } | Self::InvalidKey(_)
        )
    }

    /// Returns true if this is a corruption error.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. }) || self.is_decode_error()
    }
}

impl From<LogError> for DbError {
    fn from(err: LogError) -> Self {
        DbError::layer(ErrorCode::Log, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = LogError::unknown_operation(200);
        assert!(err.is_decode_error());
        assert!(err.is_corruption());
        assert!(err.to_string().contains("200"));

        let err = LogError::checksum_mismatch(Lsn::new(100), 0x1234, 0x5678);
        assert!(err.is_corruption());
        assert!(!err.is_decode_error());
    }

    #[test]
    fn test_apply_error_chains_cause() {
        use std::error::Error as _;

        let cause = io::Error::new(io::ErrorKind::Other, "page gone");
        let err = LogError::undo("Allocate(1:3)", cause);
        assert!(err.to_string().starts_with("undo of Allocate(1:3) failed"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_into_db_error() {
        let err: DbError = LogError::Closed.into();
        assert_eq!(err.code(), ErrorCode::Log);
    }
}
