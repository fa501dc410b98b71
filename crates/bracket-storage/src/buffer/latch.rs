//! Multi-mode page latches and the guards that hold them.
//!
//! Compatibility (row held, column requested):
//!
//! ```text
//!        S   SI  U   X
//!   S    y   y   y   n
//!   SI   y   n   n   n
//!   U    y   n   n   n
//!   X    n   n   n   n
//! ```
//!
//! SI and U both announce a later upgrade to X. While an upgrade waits for
//! shared holders to drain, new S requests queue behind it.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use bracket_common::types::PageId;

use super::frame::Frame;
use crate::page::Page;

/// Latch mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    /// Shared.
    Shared,
    /// Shared with the intention to upgrade.
    SharedIntention,
    /// Update: read now, maybe write later.
    Update,
    /// Exclusive.
    Exclusive,
}

#[derive(Debug, Default)]
struct LatchState {
    shared: u32,
    intent: Option<LatchMode>,
    exclusive: bool,
    upgrading: bool,
}

impl LatchState {
    fn grantable(&self, mode: LatchMode) -> bool {
        match mode {
            LatchMode::Shared => !self.exclusive && !self.upgrading,
            LatchMode::SharedIntention | LatchMode::Update => {
                !self.exclusive && self.intent.is_none()
            }
            LatchMode::Exclusive => !self.exclusive && self.intent.is_none() && self.shared == 0,
        }
    }

    fn grant(&mut self, mode: LatchMode) {
        match mode {
            LatchMode::Shared => self.shared += 1,
            LatchMode::SharedIntention | LatchMode::Update => self.intent = Some(mode),
            LatchMode::Exclusive => self.exclusive = true,
        }
    }

    fn release(&mut self, mode: LatchMode) {
        match mode {
            LatchMode::Shared => self.shared = self.shared.saturating_sub(1),
            LatchMode::SharedIntention | LatchMode::Update => self.intent = None,
            LatchMode::Exclusive => self.exclusive = false,
        }
    }
}

/// A page latch with S, SI, U and X modes.
#[derive(Default)]
pub struct Latch {
    state: Mutex<LatchState>,
    changed: Condvar,
}

impl Latch {
    /// Creates an unlatched latch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `mode` is granted.
    pub fn lock(&self, mode: LatchMode) {
        let mut state = self.state.lock();
        while !state.grantable(mode) {
            self.changed.wait(&mut state);
        }
        state.grant(mode);
    }

    /// Grants `mode` only if that needs no waiting.
    pub fn try_lock(&self, mode: LatchMode) -> bool {
        let mut state = self.state.lock();
        if state.grantable(mode) {
            state.grant(mode);
            true
        } else {
            false
        }
    }

    /// Releases a held `mode`.
    pub fn unlock(&self, mode: LatchMode) {
        self.state.lock().release(mode);
        self.changed.notify_all();
    }

    /// Upgrades a held SI or U latch to X, waiting for shared holders.
    pub fn upgrade(&self, from: LatchMode) {
        debug_assert!(matches!(
            from,
            LatchMode::SharedIntention | LatchMode::Update
        ));
        let mut state = self.state.lock();
        state.upgrading = true;
        while state.shared > 0 {
            self.changed.wait(&mut state);
        }
        state.upgrading = false;
        state.intent = None;
        state.exclusive = true;
    }

    /// Downgrades a held X latch to S.
    pub fn downgrade(&self) {
        {
            let mut state = self.state.lock();
            state.exclusive = false;
            state.shared += 1;
        }
        self.changed.notify_all();
    }

    /// Returns true if any mode is held.
    pub fn is_latched(&self) -> bool {
        let state = self.state.lock();
        state.shared > 0 || state.intent.is_some() || state.exclusive
    }
}

impl fmt::Debug for Latch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Latch")
            .field("shared", &state.shared)
            .field("intent", &state.intent)
            .field("exclusive", &state.exclusive)
            .finish()
    }
}

/// A fixed and latched page.
///
/// Dropping the guard releases the latch and unpins the frame, on every exit
/// path.
pub struct PageGuard {
    frame: Arc<Frame>,
    mode: LatchMode,
}

impl PageGuard {
    /// Wraps a frame that is already pinned and latched in `mode`.
    pub(crate) fn new(frame: Arc<Frame>, mode: LatchMode) -> Self {
        Self { frame, mode }
    }

    /// Page id.
    pub fn page_id(&self) -> PageId {
        self.frame.page_id()
    }

    pub(crate) fn frame(&self) -> &Frame {
        &self.frame
    }

    /// Held latch mode.
    pub fn mode(&self) -> LatchMode {
        self.mode
    }

    /// Read access to the page.
    pub fn page(&self) -> impl Deref<Target = Page> + '_ {
        self.frame.read()
    }

    /// Write access to the page. Marks the frame dirty.
    ///
    /// Only X holders may write.
    pub fn page_mut(&mut self) -> impl DerefMut<Target = Page> + '_ {
        debug_assert_eq!(self.mode, LatchMode::Exclusive, "write without X latch");
        self.frame.set_dirty();
        self.frame.write()
    }

    /// Upgrades SI or U to X.
    pub fn up_x(&mut self) {
        if self.mode != LatchMode::Exclusive {
            self.frame.latch().upgrade(self.mode);
            self.mode = LatchMode::Exclusive;
        }
    }

    /// Downgrades X to S.
    pub fn down_s(&mut self) {
        if self.mode == LatchMode::Exclusive {
            self.frame.latch().downgrade();
            self.mode = LatchMode::Shared;
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        self.frame.latch().unlock(self.mode);
        self.frame.unpin();
    }
}

impl fmt::Debug for PageGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageGuard")
            .field("page_id", &self.page_id())
            .field("mode", &self.mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_compatibility() {
        let latch = Latch::new();
        latch.lock(LatchMode::Shared);
        assert!(latch.try_lock(LatchMode::Shared));
        assert!(latch.try_lock(LatchMode::Update));
        assert!(!latch.try_lock(LatchMode::SharedIntention));
        assert!(!latch.try_lock(LatchMode::Exclusive));

        latch.unlock(LatchMode::Shared);
        latch.unlock(LatchMode::Shared);
        latch.unlock(LatchMode::Update);
        assert!(!latch.is_latched());

        latch.lock(LatchMode::Exclusive);
        assert!(!latch.try_lock(LatchMode::Shared));
        latch.downgrade();
        assert!(latch.try_lock(LatchMode::Shared));
        assert!(!latch.try_lock(LatchMode::Exclusive));
    }

    #[test]
    fn test_upgrade_waits_for_readers() {
        let latch = Arc::new(Latch::new());
        latch.lock(LatchMode::Shared);
        latch.lock(LatchMode::Update);

        let reader = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                latch.unlock(LatchMode::Shared);
            })
        };

        latch.upgrade(LatchMode::Update);
        reader.join().unwrap();
        assert!(!latch.try_lock(LatchMode::Shared));
        latch.unlock(LatchMode::Exclusive);
        assert!(!latch.is_latched());
    }

    #[test]
    fn test_pending_upgrade_blocks_new_readers() {
        let latch = Arc::new(Latch::new());
        latch.lock(LatchMode::Shared);
        latch.lock(LatchMode::SharedIntention);

        let upgrader = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                latch.upgrade(LatchMode::SharedIntention);
                latch.unlock(LatchMode::Exclusive);
            })
        };

        // Wait until the upgrade is pending.
        while !latch.state.lock().upgrading {
            thread::yield_now();
        }
        assert!(!latch.try_lock(LatchMode::Shared));
        latch.unlock(LatchMode::Shared);
        upgrader.join().unwrap();
        assert!(!latch.is_latched());
    }
}
