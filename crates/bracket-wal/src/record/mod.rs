//! Log record types and serialization.
//!
//! A record is a fixed-size header followed by one typed [`LogOperation`].

pub mod header;
pub mod operation;

pub use header::{LogRecord, RecordFlags};
pub use operation::{FormatState, LogOperation, OperationType, PointerField};
