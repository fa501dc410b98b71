//! System-wide constants for BracketDB.

// =============================================================================
// Block Space Constants
// =============================================================================

/// Default block (and page) size in bytes.
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;

/// Smallest block size a space can be created with.
///
/// Tree pages need room for the page header plus at least two records.
pub const MIN_BLOCK_SIZE: usize = 256;

/// Default number of blocks a new space starts with.
pub const DEFAULT_INITIAL_BLOCKS: u32 = 256;

/// Default extension ratio (extension size = initial blocks * ratio).
pub const DEFAULT_EXTENSION_RATIO: f64 = 0.5;

/// Number of bytes at the start of every block reserved for the in-use marker.
pub const BLOCK_HEADER_LENGTH: usize = 1;

/// Marker byte written into the first byte of every used block.
pub const BLOCK_IN_USE: u8 = 0xFF;

/// Block 0 of every container is never handed out.
pub const RESERVED_BLOCK: u32 = 0;

/// File name suffix of container data files.
pub const DATA_FILE_SUFFIX: &str = "cnt";

/// File name suffix of container metadata files.
pub const META_FILE_SUFFIX: &str = "meta";

// =============================================================================
// Index Constants
// =============================================================================

/// Values longer than `usable page space / EXTERNALIZE_FRACTION` are
/// moved to blob pages.
pub const DEFAULT_EXTERNALIZE_FRACTION: usize = 6;

/// Target fill of the left page after an occupancy-driven split.
pub const DEFAULT_SPLIT_OCCUPANCY: f64 = 0.5;

// =============================================================================
// Buffer Constants
// =============================================================================

/// Default number of page frames held by the buffer manager.
pub const DEFAULT_BUFFER_FRAMES: usize = 1024;
