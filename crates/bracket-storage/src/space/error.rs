//! Block space errors.

use std::io;

use thiserror::Error;

use bracket_common::error::{DbError, ErrorCode};
use bracket_common::types::{ContainerId, UnitId};

/// Result type for block space operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the block allocator.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum StoreError {
    /// I/O error on the data or metadata file.
    #[error("store I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Block address outside the space (or the reserved block 0).
    #[error("invalid lba {lba}: space has {size} blocks")]
    InvalidBlock { lba: u32, size: u32 },

    /// Block is already allocated.
    #[error("block already allocated, lba: {lba}")]
    BlockInUse { lba: u32 },

    /// Block is not allocated.
    #[error("invalid lba, block not in use: {lba}")]
    BlockNotInUse { lba: u32 },

    /// Block is not a member of the unit.
    #[error("block {lba} does not belong to unit {unit}")]
    NotInUnit { lba: u32, unit: UnitId },

    /// Unit does not exist.
    #[error("unit {unit} not found")]
    UnitNotFound { unit: UnitId },

    /// Unit already exists.
    #[error("unit {unit} already exists")]
    UnitExists { unit: UnitId },

    /// Operation not allowed in the current open/closed state.
    #[error("invalid state, {reason}")]
    InvalidState { reason: &'static str },

    /// Bad create parameters.
    #[error("invalid block space parameters: {reason}")]
    InvalidParameters { reason: String },

    /// Metadata catalog could not be decoded.
    #[error("corrupt block space metadata: {reason}")]
    CorruptMetadata { reason: String },

    /// Caller buffer does not hold the requested blocks.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Container already registered.
    #[error("container {id} already registered")]
    ContainerExists { id: ContainerId },

    /// Container not registered.
    #[error("container {id} not found")]
    ContainerNotFound { id: ContainerId },
}

impl StoreError {
    /// Creates an invalid-state error.
    pub fn invalid_state(reason: &'static str) -> Self {
        Self::InvalidState { reason }
    }

    /// Creates an invalid-parameters error.
    pub fn invalid_parameters(reason: impl Into<String>) -> Self {
        Self::InvalidParameters {
            reason: reason.into(),
        }
    }

    /// Creates a corrupt-metadata error.
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptMetadata {
            reason: reason.into(),
        }
    }

    /// Returns true if the error names a missing unit.
    pub fn is_unit_not_found(&self) -> bool {
        matches!(self, Self::UnitNotFound { .. })
    }

    /// Returns true if the error is a double allocation.
    pub fn is_block_in_use(&self) -> bool {
        matches!(self, Self::BlockInUse { .. })
    }
}

impl From<StoreError> for DbError {
    fn from(err: StoreError) -> Self {
        DbError::layer(ErrorCode::Store, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = StoreError::BlockInUse { lba: 7 };
        assert!(err.is_block_in_use());
        assert_eq!(err.to_string(), "block already allocated, lba: 7");

        let err = StoreError::UnitNotFound {
            unit: UnitId::new(3),
        };
        assert!(err.is_unit_not_found());
    }

    #[test]
    fn test_into_db_error() {
        let err: DbError = StoreError::invalid_state("space already closed").into();
        assert_eq!(err.code(), ErrorCode::Store);
        assert!(err.is_recoverable());
    }
}
