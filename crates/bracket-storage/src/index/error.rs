//! Bracket index errors.

use std::fmt;

use thiserror::Error;

use bracket_common::error::{DbError, ErrorCode};
use bracket_common::types::{DeweyId, PageId};
use bracket_wal::LogError;

use super::navigation::NavigationMode;
use crate::buffer::BufferError;
use crate::page::PageError;
use crate::space::StoreError;

/// Result type for index operations.
pub type IndexResult<T> = Result<T, IndexOperationError>;

/// Recovery phase an access error was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Forward processing or cursor movement.
    Access,
    /// Redo.
    Redo,
    /// Undo or rollback.
    Undo,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Access => "access",
            Self::Redo => "redo",
            Self::Undo => "undo",
        })
    }
}

/// Cross-page protocol faults: sibling traversal, redo and undo.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum IndexAccessError {
    /// The page was deallocated.
    #[error("page {page} was deleted")]
    PageDeleted { page: PageId },

    /// The page does not belong to the expected index.
    #[error("{during}: page {page} belongs to index {found}, expected {expected}")]
    RootMismatch {
        page: PageId,
        expected: PageId,
        found: PageId,
        during: Phase,
    },

    /// A sibling page is not a leaf of the expected index.
    #[error("page {page} reached from {from} is not a leaf")]
    NotALeaf { page: PageId, from: PageId },
}

impl IndexAccessError {
    /// Returns true if recovery must halt: an undo-time root mismatch.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            Self::RootMismatch {
                during: Phase::Undo,
                ..
            }
        )
    }
}

impl From<IndexAccessError> for DbError {
    fn from(err: IndexAccessError) -> Self {
        if err.is_unrecoverable() {
            DbError::unrecoverable(err)
        } else {
            DbError::layer(ErrorCode::IndexAccess, err)
        }
    }
}

/// Tree-level faults.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum IndexOperationError {
    /// Key already present.
    #[error("duplicate key {key} in index {root}")]
    DuplicateKey { root: PageId, key: DeweyId },

    /// Key absent.
    #[error("key {key} not found in index {root}")]
    KeyNotFound { root: PageId, key: DeweyId },

    /// The navigation mode cannot be used for the operation.
    #[error("invalid navigation {mode:?}: {reason}")]
    InvalidNavigation {
        mode: NavigationMode,
        reason: &'static str,
    },

    /// An empty leaf is still chained in front of another leaf.
    #[error("only the last leaf page may be empty, page {page} is empty")]
    EmptyLeaf { page: PageId },

    /// The page does not belong to the claimed index.
    #[error("page {page} belongs to index {found}, expected {expected}")]
    RootMismatch {
        page: PageId,
        expected: PageId,
        found: PageId,
    },

    /// A page of an unexpected shape was reached.
    #[error("unexpected page type at {page}: expected {expected}")]
    UnexpectedPageType { page: PageId, expected: &'static str },

    /// A record cannot be stored even in an empty leaf.
    #[error("record {key} of {len} bytes exceeds the limit of {max} bytes")]
    RecordTooLarge { key: DeweyId, len: usize, max: usize },

    /// Structure modifications did not make room.
    #[error("could not make room for {key} in index {root}")]
    SplitFailed { root: PageId, key: DeweyId },

    /// The cursor is not positioned on a record.
    #[error("cursor is not positioned on a record")]
    NotPositioned,

    /// Keys of a sequence are not strictly increasing, or do not follow the
    /// cursor.
    #[error("key {key} does not follow {previous}")]
    UnorderedSequence { previous: DeweyId, key: DeweyId },

    /// The dump sink refused output.
    #[error("could not write dump")]
    Dump(#[from] fmt::Error),

    /// Buffer fault.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// Allocator fault.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Log fault.
    #[error(transparent)]
    Log(#[from] LogError),

    /// Page content fault.
    #[error(transparent)]
    Page(#[from] PageError),

    /// Cross-page protocol fault.
    #[error(transparent)]
    Access(#[from] IndexAccessError),
}

impl IndexOperationError {
    /// Returns true for a duplicate key.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }

    /// Returns true for a missing key.
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound { .. })
    }

    /// Returns true if recovery must halt.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Access(err) if err.is_unrecoverable())
    }
}

impl From<IndexOperationError> for DbError {
    fn from(err: IndexOperationError) -> Self {
        match err {
            IndexOperationError::Access(access) => access.into(),
            IndexOperationError::Buffer(buffer) => buffer.into(),
            IndexOperationError::Store(store) => store.into(),
            IndexOperationError::Log(log) => log.into(),
            other => DbError::layer(ErrorCode::IndexOperation, other),
        }
    }
}
