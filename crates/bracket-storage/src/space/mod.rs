//! Block allocation.
//!
//! Every container is a [`BlockSpace`]: a data file of fixed-size blocks and a
//! metadata catalog. Blocks are grouped into units so that an index can be
//! reclaimed in one step.
//!
//! ```text
//!   global bitmap   1 1 1 0 1 0 0 1 ...      (block 0 always set)
//!   unit 1          . 1 1 . . . . 1
//!   unit 2          . . . . 1 . . .
//! ```
//!
//! The global bitmap is authoritative. The first byte of a written block is a
//! used marker that only the crash-repair scan reads.

mod bitmap;
mod block_space;
mod error;
mod meta;
mod registry;

pub use bitmap::Bitmap;
pub use block_space::{BlockSpace, RepairReport};
pub use error::{StoreError, StoreResult};
pub use meta::SpaceMeta;
pub use registry::ContainerRegistry;
