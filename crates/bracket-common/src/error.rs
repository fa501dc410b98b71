//! Database error types.
//!
//! Every layer defines its own error enum (allocator, buffer, index, log).
//! At the transaction boundary they all collapse into [`DbError`], which
//! carries a stable [`ErrorCode`] and keeps the low-level cause chained as
//! `source` for diagnostics.

use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

use crate::types::TxnId;

/// Boxed error used to chain lower-layer causes.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result type alias for transaction-level operations.
pub type DbResult<T> = std::result::Result<T, DbError>;

/// Error codes for categorizing errors.
///
/// These codes can be used for programmatic error handling and
/// are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Unknown or unspecified error.
    Unknown = 0x0000,
    /// Internal error (bug).
    Internal = 0x0001,
    /// Invalid argument provided.
    InvalidArgument = 0x0003,

    // I/O errors (0x0100 - 0x01FF)
    /// General I/O error.
    Io = 0x0100,
    /// Data corruption detected.
    Corruption = 0x0104,

    // Storage errors (0x0200 - 0x02FF)
    /// Block allocator fault.
    Store = 0x0200,
    /// Buffer fault.
    Buffer = 0x0201,
    /// Index operation fault.
    IndexOperation = 0x0202,
    /// Index access (cross-page or recovery) fault.
    IndexAccess = 0x0203,

    // Transaction errors (0x0300 - 0x03FF)
    /// Transaction was aborted.
    TransactionAborted = 0x0300,
    /// Transaction is in a state that does not allow the operation.
    InvalidTransactionState = 0x0301,

    // Log errors (0x0400 - 0x04FF)
    /// Log decoding or transport fault.
    Log = 0x0400,
    /// Recovery hit a state that must not occur.
    Unrecoverable = 0x0401,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "I/O",
            0x02 => "Storage",
            0x03 => "Transaction",
            0x04 => "Log",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The transaction-boundary error type.
///
/// # Example
///
/// ```rust
/// use bracket_common::error::{DbError, DbResult, ErrorCode};
///
/// fn check(block_size: usize) -> DbResult<()> {
///     if block_size == 0 {
///         return Err(DbError::invalid_argument("block size must be positive"));
///     }
///     Ok(())
/// }
///
/// assert_eq!(check(0).unwrap_err().code(), ErrorCode::InvalidArgument);
/// ```
#[derive(Debug, Error)]
pub enum DbError {
    /// Internal error (bug).
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Error message.
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Data corruption detected.
    #[error("data corruption detected: {message}")]
    Corruption {
        /// Error message.
        message: String,
    },

    /// A lower layer failed.
    #[error("{code} failure: {source}")]
    Layer {
        /// Category of the failing layer.
        code: ErrorCode,
        /// Chained cause.
        #[source]
        source: BoxError,
    },

    /// The transaction was aborted; the cause is chained.
    #[error("transaction {txn_id} aborted: {source}")]
    TransactionAborted {
        /// The aborted transaction.
        txn_id: TxnId,
        /// Chained cause.
        #[source]
        source: BoxError,
    },

    /// The transaction is not in a state that allows the operation.
    #[error("transaction {txn_id} cannot {operation} in state {state}")]
    InvalidTransactionState {
        /// The transaction.
        txn_id: TxnId,
        /// Attempted operation.
        operation: &'static str,
        /// Current state name.
        state: String,
    },

    /// Recovery must halt.
    #[error("unrecoverable: {source}")]
    Unrecoverable {
        /// Chained cause.
        #[source]
        source: BoxError,
    },
}

impl DbError {
    /// Returns the error code for this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Internal { .. } => ErrorCode::Internal,
            Self::InvalidArgument { .. } | Self::InvalidConfig { .. } => ErrorCode::InvalidArgument,
            Self::Io { .. } => ErrorCode::Io,
            Self::Corruption { .. } => ErrorCode::Corruption,
            Self::Layer { code, .. } => *code,
            Self::TransactionAborted { .. } => ErrorCode::TransactionAborted,
            Self::InvalidTransactionState { .. } => ErrorCode::InvalidTransactionState,
            Self::Unrecoverable { .. } => ErrorCode::Unrecoverable,
        }
    }

    /// Returns true if the surrounding transaction can be rolled back and retried.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Unrecoverable { .. } | Self::Corruption { .. } | Self::Internal { .. }
        )
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a corruption error.
    #[must_use]
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Wraps a lower-layer error.
    #[must_use]
    pub fn layer(code: ErrorCode, source: impl Into<BoxError>) -> Self {
        Self::Layer {
            code,
            source: source.into(),
        }
    }

    /// Wraps the cause of an abort.
    #[must_use]
    pub fn aborted(txn_id: TxnId, source: impl Into<BoxError>) -> Self {
        Self::TransactionAborted {
            txn_id,
            source: source.into(),
        }
    }

    /// Wraps a fault that must halt recovery.
    #[must_use]
    pub fn unrecoverable(source: impl Into<BoxError>) -> Self {
        Self::Unrecoverable {
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_codes() {
        assert_eq!(DbError::internal("x").code(), ErrorCode::Internal);
        assert_eq!(DbError::invalid_config("x").code(), ErrorCode::InvalidArgument);
        assert_eq!(ErrorCode::Store.category(), "Storage");
        assert_eq!(ErrorCode::Log.category(), "Log");
        assert_eq!(ErrorCode::TransactionAborted.as_u16(), 0x0300);
    }

    #[test]
    fn test_cause_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = DbError::aborted(TxnId::new(7), DbError::from(io));
        assert!(err.to_string().contains("transaction 7 aborted"));
        let cause = err.source().unwrap();
        assert!(cause.to_string().contains("disk gone"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_unrecoverable() {
        let err = DbError::unrecoverable(DbError::corruption("root mismatch"));
        assert_eq!(err.code(), ErrorCode::Unrecoverable);
        assert!(!err.is_recoverable());
    }
}
