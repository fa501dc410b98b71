//! Buffer errors.

use thiserror::Error;

use bracket_common::error::{DbError, ErrorCode};
use bracket_wal::LogError;

use crate::page::PageError;
use crate::space::StoreError;

/// Result type for buffer operations.
pub type BufferResult<T> = Result<T, BufferError>;

/// Errors raised while fixing, creating or writing back pages.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Allocator or block I/O failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Log failure (allocation logging or the WAL force before write-back).
    #[error(transparent)]
    Log(#[from] LogError),

    /// The page image is damaged or cannot hold its content.
    #[error(transparent)]
    Page(#[from] PageError),

    /// Every frame is pinned.
    #[error("no free frames available, all {capacity} pages are pinned")]
    NoFreeFrames {
        /// Frame capacity.
        capacity: usize,
    },
}

impl BufferError {
    /// Returns true if the page image failed verification.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Page(err) if err.is_corruption())
    }

    /// Returns true if the error is a fix of a block that is not allocated.
    pub fn is_page_deleted(&self) -> bool {
        matches!(self, Self::Store(StoreError::BlockNotInUse { .. }))
    }
}

impl From<BufferError> for DbError {
    fn from(err: BufferError) -> Self {
        if err.is_corruption() {
            return DbError::corruption(err.to_string());
        }
        DbError::layer(ErrorCode::Buffer, err)
    }
}
