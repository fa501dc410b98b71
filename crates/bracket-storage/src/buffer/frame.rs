//! Buffer frame - a cached page with its latch and replacement state.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use bracket_common::types::{PageId, UnitId};

use super::latch::Latch;
use crate::page::Page;

/// A buffer frame holds a single decoded page.
///
/// The pin count and dirty flag are atomics so the frame table lock is only
/// held while a frame is looked up or replaced. The page itself sits behind
/// an `RwLock` for memory safety; callers serialize through the [`Latch`].
pub struct Frame {
    /// Page held by this frame.
    page_id: PageId,
    /// S/SI/U/X page latch.
    latch: Latch,
    /// Decoded page.
    page: RwLock<Page>,
    /// Number of guards referencing the frame.
    pin_count: AtomicU32,
    /// Modified since the last write-back.
    dirty: AtomicBool,
    /// Set once the page was deallocated; the frame must never be written.
    discarded: AtomicBool,
    /// Replacement clock value of the last fix.
    last_use: AtomicU64,
}

impl Frame {
    /// Creates an unpinned, clean frame.
    pub fn new(page: Page) -> Self {
        Self {
            page_id: page.id(),
            latch: Latch::new(),
            page: RwLock::new(page),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            discarded: AtomicBool::new(false),
            last_use: AtomicU64::new(0),
        }
    }

    /// Creates a placeholder for a page whose block is still being read.
    pub(crate) fn loading(page_id: PageId) -> Self {
        Self::new(Page::new(page_id, UnitId::FIRST, 0))
    }

    /// Page id.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Page latch.
    #[inline]
    pub fn latch(&self) -> &Latch {
        &self.latch
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.page.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.page.write()
    }

    /// Pins the frame and records the use.
    pub fn pin(&self, tick: u64) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
        self.last_use.store(tick, Ordering::Relaxed);
    }

    /// Unpins the frame.
    pub fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin of unpinned frame {}", self.page_id);
    }

    /// Returns true if any guard references the frame.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }

    /// Returns the pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Marks the page modified.
    #[inline]
    pub fn set_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Returns true if the page was modified since the last write-back.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Replacement clock value of the last fix.
    #[inline]
    pub fn last_use(&self) -> u64 {
        self.last_use.load(Ordering::Relaxed)
    }

    pub(crate) fn discard(&self) {
        self.discarded.store(true, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
    }

    /// Returns true once the page was deallocated.
    #[inline]
    pub fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("page_id", &self.page_id)
            .field("pin_count", &self.pin_count())
            .field("dirty", &self.is_dirty())
            .field("latch", &self.latch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_and_dirty() {
        let frame = Frame::new(Page::new(PageId::new(1, 3), UnitId::FIRST, 512));
        assert!(!frame.is_pinned());
        frame.pin(7);
        frame.pin(9);
        assert_eq!(frame.pin_count(), 2);
        assert_eq!(frame.last_use(), 9);
        frame.unpin();
        frame.unpin();
        assert!(!frame.is_pinned());

        frame.set_dirty();
        assert!(frame.is_dirty());
        frame.discard();
        assert!(!frame.is_dirty());
        assert!(frame.is_discarded());
    }
}
