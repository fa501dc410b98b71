//! # bracket-storage
//!
//! Storage core of BracketDB.
//!
//! This crate provides:
//! - A block allocator per container with unit-level ownership and
//!   crash-consistent metadata
//! - A buffer manager with page latches (S, SI, U, X) that honors the WAL rule
//! - Leaf and branch page contexts and externalized values in blob chains
//! - The bracket index: a B+-tree of node records keyed by DeweyIDs, with
//!   hierarchical navigation and cursors
//! - Redo and undo handlers, a transaction manager and restart recovery
//!
//! ## Layers
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  recovery    TxManager, restart              │
//! ├──────────────────────────────────────────────┤
//! │  index       BracketIndex, BracketIter       │
//! ├──────────────────────────────────────────────┤
//! │  page / blob LeafPage, BranchPage, BlobStore │
//! ├──────────────────────────────────────────────┤
//! │  buffer      BufferManager, PageGuard        │
//! ├──────────────────────────────────────────────┤
//! │  space       BlockSpace, ContainerRegistry   │
//! └──────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Externalized values.
pub mod blob;

/// Page cache and latches.
pub mod buffer;

/// Positioned block file I/O.
pub mod file;

/// Bracket index.
pub mod index;

/// Page formats.
pub mod page;

/// Transactions and recovery.
pub mod recovery;

/// Block allocation.
pub mod space;

pub use blob::BlobStore;
pub use buffer::{BufferManager, LatchMode, PageGuard};
pub use index::{BracketIndex, BracketIter, NavigationMode, NavigationStatus, OpenMode};
pub use recovery::{RestartReport, TxManager};
pub use space::{BlockSpace, ContainerRegistry};
