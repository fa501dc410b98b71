//! Buffer manager for BracketDB.
//!
//! Pages are cached decoded, one per frame, and handed out as [`PageGuard`]s
//! that hold a pin and a latch until dropped.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      BufferManager                        │
//! │   page table: HashMap<PageId, Arc<Frame>>                 │
//! │                                                           │
//! │   ┌──────────┐ ┌──────────┐          ┌──────────┐         │
//! │   │ Frame    │ │ Frame    │   ...    │ Frame    │         │
//! │   │ latch    │ │ latch    │          │ latch    │         │
//! │   │ Page     │ │ Page     │          │ Page     │         │
//! │   │ pin/dirty│ │ pin/dirty│          │ pin/dirty│         │
//! │   └──────────┘ └──────────┘          └──────────┘         │
//! │         │ miss / write-back (log forced to page LSN)      │
//! │         ▼                                                 │
//! │   ContainerRegistry ──► BlockSpace (read / write blocks)  │
//! └───────────────────────────────────────────────────────────┘
//! ```

mod error;
mod frame;
mod latch;
mod manager;

pub use error::{BufferError, BufferResult};
pub use frame::Frame;
pub use latch::{Latch, LatchMode, PageGuard};
pub use manager::BufferManager;

/// Statistics for buffer monitoring.
#[derive(Debug, Clone, Default)]
pub struct BufferStats {
    /// Page fixes.
    pub fixes: u64,
    /// Fixes served from the cache.
    pub hits: u64,
    /// Fixes that read the block.
    pub misses: u64,
    /// Frames replaced.
    pub evictions: u64,
    /// Pages written back.
    pub writes: u64,
    /// Cached pages.
    pub cached_frames: usize,
    /// Pinned pages.
    pub pinned_frames: usize,
    /// Dirty pages.
    pub dirty_frames: usize,
}

impl BufferStats {
    /// Returns the cache hit ratio (0.0 to 1.0).
    pub fn hit_ratio(&self) -> f64 {
        if self.fixes == 0 {
            0.0
        } else {
            self.hits as f64 / self.fixes as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_hit_ratio() {
        let mut stats = BufferStats::default();
        assert_eq!(stats.hit_ratio(), 0.0);

        stats.fixes = 40;
        stats.hits = 30;
        assert!((stats.hit_ratio() - 0.75).abs() < f64::EPSILON);
    }
}
