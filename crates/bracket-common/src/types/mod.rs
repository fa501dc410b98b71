//! Type definitions for BracketDB.
//!
//! This module contains the identifiers, keys and node records shared by
//! every layer.

mod dewey;
mod ids;
mod record;

pub use dewey::{DeweyId, DeweyIdError, ATTRIBUTE_DIVISION, MAX_DIVISIONS};
pub use ids::{ContainerId, Lsn, PageId, TxnId, UnitId};
pub use record::{NodeRecord, PageKind};
