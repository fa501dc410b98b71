//! Page-level errors.

use thiserror::Error;

use bracket_common::types::{DeweyId, PageId};

/// Result type for page operations.
pub type PageResult<T> = Result<T, PageError>;

/// Errors raised while decoding or mutating one page.
#[derive(Debug, Error)]
#[allow(missing_docs)] // Fields are documented by variant docs
pub enum PageError {
    /// The page has the wrong shape for the operation.
    #[error("page {page} is a {found} page, expected {expected}")]
    WrongKind {
        page: PageId,
        expected: &'static str,
        found: &'static str,
    },

    /// Key already present.
    #[error("duplicate key {key} in page {page}")]
    DuplicateKey { page: PageId, key: DeweyId },

    /// Key absent.
    #[error("key {key} not found in page {page}")]
    KeyNotFound { page: PageId, key: DeweyId },

    /// Applying the change would overflow the page.
    #[error("page {page} overflow: need {needed} bytes, {available} free")]
    Overflow {
        page: PageId,
        needed: usize,
        available: usize,
    },

    /// Operation does not target page content.
    #[error("operation {operation} cannot be applied to page {page}")]
    UnsupportedOperation { page: PageId, operation: String },

    /// Stored checksum does not match the page image.
    #[error("checksum mismatch for page {page}: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        page: PageId,
        stored: u32,
        computed: u32,
    },

    /// The page image cannot be decoded.
    #[error("page {page} is corrupted: {reason}")]
    Corrupted { page: PageId, reason: String },
}

impl PageError {
    /// Creates a corruption error.
    pub fn corrupted(page: PageId, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            page,
            reason: reason.into(),
        }
    }

    /// Returns true if the page image is damaged.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. } | Self::Corrupted { .. })
    }
}
