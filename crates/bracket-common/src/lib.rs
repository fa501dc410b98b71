//! # bracket-common
//!
//! Common types, errors, and configuration for BracketDB.
//!
//! This crate provides the foundational types used across all BracketDB
//! components:
//!
//! - **Types**: identifiers (`PageId`, `Lsn`, `TxnId`, `UnitId`) and the
//!   hierarchical document key `DeweyId`
//! - **Errors**: the transaction-boundary error `DbError`
//! - **Config**: `StorageConfig`, loadable from TOML
//! - **Constants**: block space and index defaults
//!
//! ## Example
//!
//! ```rust
//! use bracket_common::types::{DeweyId, PageId};
//!
//! let page = PageId::new(1, 42);
//! let key: DeweyId = "1.3.5".parse().unwrap();
//! assert_eq!(key.parent().unwrap().to_string(), "1.3");
//! assert!(page.is_valid());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

// Re-export commonly used items at the crate root
pub use config::StorageConfig;
pub use error::{DbError, DbResult, ErrorCode};
pub use types::{ContainerId, DeweyId, Lsn, NodeRecord, PageId, TxnId, UnitId};
