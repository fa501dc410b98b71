//! Buffer manager implementation.
//!
//! The buffer manager caches decoded pages of every registered container,
//! hands them out latched and pinned, and writes dirty pages back after
//! forcing the log up to their LSN.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use bracket_common::config::StorageConfig;
use bracket_common::types::{ContainerId, PageId, UnitId};
use bracket_wal::{LogManager, LogOperation, PendingAction, Tx};

use super::error::{BufferError, BufferResult};
use super::frame::Frame;
use super::latch::{LatchMode, PageGuard};
use super::BufferStats;
use crate::page::Page;
use crate::space::{BlockSpace, ContainerRegistry};

/// Caches pages of the containers in a [`ContainerRegistry`].
///
/// Frames are replaced least-recently-fixed first; pinned frames are never
/// replaced. Every write-back honors the WAL rule: the log is forced up to
/// the page LSN before the block is written.
pub struct BufferManager {
    /// Open containers.
    registry: Arc<ContainerRegistry>,
    /// Log forced before write-back.
    log: Arc<LogManager>,
    /// Maximum number of cached pages.
    capacity: usize,
    /// Page table.
    frames: Mutex<HashMap<PageId, Arc<Frame>>>,
    /// Replacement clock.
    clock: AtomicU64,
    fix_count: AtomicU64,
    hit_count: AtomicU64,
    miss_count: AtomicU64,
    eviction_count: AtomicU64,
    write_count: AtomicU64,
}

impl BufferManager {
    /// Creates a buffer manager holding at most `capacity` pages.
    pub fn new(registry: Arc<ContainerRegistry>, log: Arc<LogManager>, capacity: usize) -> Self {
        Self {
            registry,
            log,
            capacity: capacity.max(1),
            frames: Mutex::new(HashMap::with_capacity(capacity)),
            clock: AtomicU64::new(0),
            fix_count: AtomicU64::new(0),
            hit_count: AtomicU64::new(0),
            miss_count: AtomicU64::new(0),
            eviction_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
        }
    }

    /// Creates a buffer manager sized by `config.buffer_frames`.
    pub fn with_config(
        registry: Arc<ContainerRegistry>,
        log: Arc<LogManager>,
        config: &StorageConfig,
    ) -> Self {
        Self::new(registry, log, config.buffer_frames)
    }

    /// Open containers.
    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    /// The log.
    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    /// Maximum number of cached pages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The block space of `container`.
    pub fn space(&self, container: ContainerId) -> BufferResult<Arc<BlockSpace>> {
        Ok(self.registry.get(container)?)
    }

    /// Block size of `container`.
    pub fn block_size(&self, container: ContainerId) -> BufferResult<usize> {
        Ok(self.space(container)?.size_of_block()?)
    }

    /// Fixes a page, blocking until `mode` is granted.
    pub fn fix_page(&self, page: PageId, mode: LatchMode) -> BufferResult<PageGuard> {
        loop {
            let frame = self.pin(page)?;
            frame.latch().lock(mode);
            if !frame.is_discarded() {
                return Ok(PageGuard::new(frame, mode));
            }
            // failed load or dropped while waiting: look the page up again
            frame.latch().unlock(mode);
            frame.unpin();
        }
    }

    /// Fixes a page only if `mode` can be granted without waiting.
    pub fn try_fix_page(&self, page: PageId, mode: LatchMode) -> BufferResult<Option<PageGuard>> {
        let frame = self.pin(page)?;
        if !frame.latch().try_lock(mode) {
            frame.unpin();
            return Ok(None);
        }
        if frame.is_discarded() {
            frame.latch().unlock(mode);
            frame.unpin();
            return Ok(None);
        }
        Ok(Some(PageGuard::new(frame, mode)))
    }

    /// Allocates a block for `unit`, logs the allocation and returns the new
    /// unformatted page latched exclusively.
    pub fn create_page(&self, tx: &Tx, container: ContainerId, unit: UnitId) -> BufferResult<PageGuard> {
        let space = self.space(container)?;
        let block_size = space.size_of_block()?;

        self.make_room()?;
        let block = space.allocate(None, unit, false)?;
        let id = PageId::new(container.as_u32(), block);

        let lsn = match tx.log_update(LogOperation::Allocate { page: id, unit }) {
            Ok(lsn) => lsn,
            Err(err) => {
                if let Err(release) = space.release(block, unit, false) {
                    warn!(page = %id, error = %release, "could not release unlogged allocation");
                }
                return Err(err.into());
            }
        };

        let mut page = Page::new(id, unit, block_size);
        page.set_lsn(lsn);
        let frame = Arc::new(Frame::new(page));
        frame.set_dirty();
        frame.latch().lock(LatchMode::Exclusive);
        frame.pin(self.tick());
        self.frames.lock().insert(id, Arc::clone(&frame));

        trace!(txn = %tx.id(), page = %id, %unit, "created page");
        Ok(PageGuard::new(frame, LatchMode::Exclusive))
    }

    /// Schedules `page` for deallocation when `tx` commits.
    pub fn delete_page(&self, tx: &Tx, page: PageId, unit: UnitId) {
        tx.add_pending(PendingAction::FreePage { page, unit });
    }

    /// Writes one page back if it is cached and dirty.
    pub fn flush_page(&self, page: PageId) -> BufferResult<()> {
        let frame = {
            let frames = self.frames.lock();
            match frames.get(&page) {
                Some(frame) => {
                    frame.pin(self.tick());
                    Arc::clone(frame)
                }
                None => return Ok(()),
            }
        };
        frame.latch().lock(LatchMode::Shared);
        let result = self.write_back(&frame);
        frame.latch().unlock(LatchMode::Shared);
        frame.unpin();
        result
    }

    /// Writes the page held by `guard` back if it is dirty. The latch stays
    /// held, so the page cannot change before it is on disk.
    pub fn flush_guarded(&self, guard: &PageGuard) -> BufferResult<()> {
        self.write_back(guard.frame())
    }

    /// Writes every dirty page back and syncs the data files it touched.
    /// Returns the number of pages written.
    pub fn flush_all(&self) -> BufferResult<usize> {
        let dirty: Vec<Arc<Frame>> = {
            let frames = self.frames.lock();
            let tick = self.tick();
            frames
                .values()
                .filter(|frame| frame.is_dirty())
                .map(|frame| {
                    frame.pin(tick);
                    Arc::clone(frame)
                })
                .collect()
        };

        let mut written = 0;
        let mut containers = Vec::new();
        let mut result = Ok(());
        for frame in &dirty {
            if result.is_ok() {
                frame.latch().lock(LatchMode::Shared);
                let was_dirty = frame.is_dirty() && !frame.is_discarded();
                result = self.write_back(frame);
                frame.latch().unlock(LatchMode::Shared);
                if was_dirty && result.is_ok() {
                    written += 1;
                    let container = frame.page_id().container_id();
                    if !containers.contains(&container) {
                        containers.push(container);
                    }
                }
            }
            frame.unpin();
        }
        result?;

        for container in containers {
            self.space(container)?.sync_data()?;
        }
        debug!(written, "flushed buffer");
        Ok(written)
    }

    /// Forgets a cached page without writing it back.
    ///
    /// Must run before the block is released, so a later write-back cannot
    /// stamp the in-use marker on a free block.
    pub fn drop_frame(&self, page: PageId) {
        let frame = self.frames.lock().remove(&page);
        if let Some(frame) = frame {
            frame.latch().lock(LatchMode::Exclusive);
            frame.discard();
            frame.latch().unlock(LatchMode::Exclusive);
            trace!(%page, "dropped frame");
        }
    }

    /// Forgets every cached page without writing anything, as a crash would.
    pub fn discard_all(&self) {
        let mut frames = self.frames.lock();
        for frame in frames.values() {
            frame.discard();
        }
        let lost = frames.len();
        frames.clear();
        debug!(lost, "discarded buffer");
    }

    /// Returns true if `page` is cached.
    pub fn is_cached(&self, page: PageId) -> bool {
        self.frames.lock().contains_key(&page)
    }

    /// Returns a statistics snapshot.
    pub fn stats(&self) -> BufferStats {
        let frames = self.frames.lock();
        BufferStats {
            fixes: self.fix_count.load(Ordering::Relaxed),
            hits: self.hit_count.load(Ordering::Relaxed),
            misses: self.miss_count.load(Ordering::Relaxed),
            evictions: self.eviction_count.load(Ordering::Relaxed),
            writes: self.write_count.load(Ordering::Relaxed),
            cached_frames: frames.len(),
            pinned_frames: frames.values().filter(|f| f.is_pinned()).count(),
            dirty_frames: frames.values().filter(|f| f.is_dirty()).count(),
        }
    }

    // ===== Internal =====

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn lookup(&self, page: PageId) -> Option<Arc<Frame>> {
        let frames = self.frames.lock();
        let frame = frames.get(&page)?;
        frame.pin(self.tick());
        Some(Arc::clone(frame))
    }

    /// Pins the frame of `page`, reading the block on a miss.
    ///
    /// The block is read without the table lock. The new frame sits in the
    /// table latched exclusively until its content is in place, so other
    /// fixers of the same page wait on the latch instead of reading twice.
    fn pin(&self, page: PageId) -> BufferResult<Arc<Frame>> {
        self.fix_count.fetch_add(1, Ordering::Relaxed);
        if let Some(frame) = self.lookup(page) {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
            return Ok(frame);
        }

        self.miss_count.fetch_add(1, Ordering::Relaxed);
        self.make_room()?;
        let frame = {
            let mut frames = self.frames.lock();
            if let Some(frame) = frames.get(&page) {
                frame.pin(self.tick());
                return Ok(Arc::clone(frame));
            }
            let frame = Arc::new(Frame::loading(page));
            frame.latch().lock(LatchMode::Exclusive);
            frame.pin(self.tick());
            frames.insert(page, Arc::clone(&frame));
            frame
        };

        let loaded = match self.load(page) {
            Ok(content) => {
                *frame.write() = content;
                Ok(())
            }
            Err(err) => {
                self.forget(&frame);
                frame.discard();
                Err(err)
            }
        };
        frame.latch().unlock(LatchMode::Exclusive);
        match loaded {
            Ok(()) => Ok(frame),
            Err(err) => {
                warn!(%page, error = %err, "page load failed");
                frame.unpin();
                Err(err)
            }
        }
    }

    /// Removes `frame` from the table if it is still the cached frame of its
    /// page.
    fn forget(&self, frame: &Arc<Frame>) {
        let mut frames = self.frames.lock();
        let id = frame.page_id();
        if frames.get(&id).is_some_and(|cached| Arc::ptr_eq(cached, frame)) {
            frames.remove(&id);
        }
    }

    fn load(&self, page: PageId) -> BufferResult<Page> {
        let space = self.space(page.container_id())?;
        let mut buf = vec![0u8; space.size_of_block()?];
        space.read(page.block(), &mut buf, 1)?;
        Ok(Page::decode(page, &buf)?)
    }

    /// Evicts least recently fixed unpinned frames until the table has room.
    ///
    /// A dirty victim stays cached and pinned while it is written, so a
    /// concurrent fix finds it instead of reading a stale block. It is only
    /// removed if nobody fixed or dirtied it in the meantime.
    fn make_room(&self) -> BufferResult<()> {
        loop {
            let victim = {
                let frames = self.frames.lock();
                if frames.len() < self.capacity {
                    return Ok(());
                }
                let victim = frames
                    .values()
                    .filter(|frame| !frame.is_pinned())
                    .min_by_key(|frame| frame.last_use())
                    .ok_or(BufferError::NoFreeFrames {
                        capacity: self.capacity,
                    })?;
                victim.pin(victim.last_use());
                Arc::clone(victim)
            };

            if victim.is_dirty() {
                // whoever latched it meanwhile keeps it; pick another victim
                if !victim.latch().try_lock(LatchMode::Shared) {
                    victim.unpin();
                    continue;
                }
                let written = self.write_back(&victim);
                victim.latch().unlock(LatchMode::Shared);
                if let Err(err) = written {
                    victim.unpin();
                    return Err(err);
                }
            }

            let mut frames = self.frames.lock();
            victim.unpin();
            if victim.is_pinned() || victim.is_dirty() {
                continue;
            }
            let id = victim.page_id();
            if frames.get(&id).is_some_and(|cached| Arc::ptr_eq(cached, &victim)) {
                frames.remove(&id);
                self.eviction_count.fetch_add(1, Ordering::Relaxed);
                trace!(page = %id, "evicted page");
            }
        }
    }

    /// Writes a dirty frame. The caller holds a latch on it.
    fn write_back(&self, frame: &Frame) -> BufferResult<()> {
        if !frame.is_dirty() || frame.is_discarded() {
            return Ok(());
        }
        let page = frame.read();
        self.log.flush(page.lsn())?;
        let bytes = page.encode()?;
        self.space(page.id().container_id())?
            .write(page.id().block(), &bytes, 1)?;
        frame.clear_dirty();
        self.write_count.fetch_add(1, Ordering::Relaxed);
        trace!(page = %page.id(), lsn = %page.lsn(), "wrote page");
        Ok(())
    }
}

impl fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferManager")
            .field("capacity", &self.capacity)
            .field("cached", &self.frames.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bracket_common::types::{Lsn, TxnId};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        buffer: BufferManager,
        tx: Tx,
        unit: UnitId,
    }

    const CONTAINER: ContainerId = ContainerId::new(1);

    fn fixture(capacity: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let space = Arc::new(BlockSpace::new(dir.path(), CONTAINER));
        space.create(512, 16, 0.5).unwrap();
        space.open().unwrap();
        let unit = space.create_unit(None, false).unwrap();

        let registry = Arc::new(ContainerRegistry::new());
        registry.register(space).unwrap();
        let log = Arc::new(LogManager::in_memory());
        let tx = Tx::new(TxnId::new(1), Arc::clone(&log));
        Fixture {
            _dir: dir,
            buffer: BufferManager::new(registry, log, capacity),
            tx,
            unit,
        }
    }

    #[test]
    fn test_create_page_logs_allocation() {
        let f = fixture(8);
        let guard = f.buffer.create_page(&f.tx, CONTAINER, f.unit).unwrap();
        let id = guard.page_id();
        assert_eq!(id.block(), 1);
        assert_eq!(guard.mode(), LatchMode::Exclusive);
        assert!(guard.page().is_unformatted());

        let record = f.tx.log().get(guard.page().lsn()).unwrap();
        assert_eq!(
            record.op,
            LogOperation::Allocate {
                page: id,
                unit: f.unit
            }
        );
    }

    #[test]
    fn test_write_back_forces_log_and_reloads() {
        let f = fixture(8);
        let id = {
            let guard = f.buffer.create_page(&f.tx, CONTAINER, f.unit).unwrap();
            guard.page_id()
        };
        assert_eq!(f.tx.log().flushed_lsn(), Lsn::INVALID);

        assert_eq!(f.buffer.flush_all().unwrap(), 1);
        assert_eq!(f.tx.log().flushed_lsn(), Lsn::new(1));

        f.buffer.discard_all();
        let guard = f.buffer.fix_page(id, LatchMode::Shared).unwrap();
        assert_eq!(guard.page().lsn(), Lsn::new(1));
        assert_eq!(guard.page().unit(), f.unit);
    }

    #[test]
    fn test_eviction_skips_pinned_frames() {
        let f = fixture(2);
        let first = f.buffer.create_page(&f.tx, CONTAINER, f.unit).unwrap();
        let second = f.buffer.create_page(&f.tx, CONTAINER, f.unit).unwrap();
        let err = f.buffer.create_page(&f.tx, CONTAINER, f.unit).unwrap_err();
        assert!(matches!(err, BufferError::NoFreeFrames { capacity: 2 }));

        let evicted = first.page_id();
        drop(first);
        let third = f.buffer.create_page(&f.tx, CONTAINER, f.unit).unwrap();
        assert!(!f.buffer.is_cached(evicted));
        assert!(f.buffer.is_cached(second.page_id()));
        assert!(f.buffer.is_cached(third.page_id()));
        assert_eq!(f.buffer.stats().evictions, 1);
        assert_eq!(f.buffer.stats().writes, 1);
    }

    #[test]
    fn test_failed_load_leaves_no_frame() {
        let f = fixture(4);
        let missing = PageId::new(CONTAINER.as_u32(), 500);
        assert!(f.buffer.fix_page(missing, LatchMode::Shared).is_err());
        assert!(!f.buffer.is_cached(missing));
        assert_eq!(f.buffer.stats().pinned_frames, 0);
        assert!(f.buffer.try_fix_page(missing, LatchMode::Shared).is_err());
    }

    #[test]
    fn test_concurrent_fixes_with_evictions() {
        let f = fixture(3);
        let mut pages = Vec::new();
        for _ in 0..8 {
            let guard = f.buffer.create_page(&f.tx, CONTAINER, f.unit).unwrap();
            pages.push((guard.page_id(), guard.page().lsn()));
        }

        std::thread::scope(|scope| {
            for t in 0..4 {
                let buffer = &f.buffer;
                let pages = &pages;
                scope.spawn(move || {
                    for i in 0..200 {
                        let (id, lsn) = pages[(i * 7 + t) % pages.len()];
                        let guard = buffer.fix_page(id, LatchMode::Shared).unwrap();
                        assert_eq!(guard.page().lsn(), lsn);
                        assert_eq!(guard.page_id(), id);
                    }
                });
            }
        });

        let stats = f.buffer.stats();
        assert_eq!(stats.pinned_frames, 0);
        assert!(stats.cached_frames <= 3 + 4);
        assert!(stats.evictions > 0);
    }

    #[test]
    fn test_try_fix_respects_latches() {
        let f = fixture(4);
        let guard = f.buffer.create_page(&f.tx, CONTAINER, f.unit).unwrap();
        let id = guard.page_id();
        assert!(f.buffer.try_fix_page(id, LatchMode::Shared).unwrap().is_none());
        drop(guard);

        let shared = f.buffer.try_fix_page(id, LatchMode::Shared).unwrap().unwrap();
        assert!(f.buffer.try_fix_page(id, LatchMode::Update).unwrap().is_some());
        drop(shared);
        assert_eq!(f.buffer.stats().pinned_frames, 0);
    }

    #[test]
    fn test_dropped_frame_is_not_written() {
        let f = fixture(4);
        let id = f
            .buffer
            .create_page(&f.tx, CONTAINER, f.unit)
            .unwrap()
            .page_id();
        f.buffer.drop_frame(id);
        assert!(!f.buffer.is_cached(id));
        assert_eq!(f.buffer.flush_all().unwrap(), 0);
    }

    #[test]
    fn test_delete_page_is_deferred() {
        let f = fixture(4);
        let id = f
            .buffer
            .create_page(&f.tx, CONTAINER, f.unit)
            .unwrap()
            .page_id();
        f.buffer.delete_page(&f.tx, id, f.unit);
        assert_eq!(
            f.tx.take_pending(),
            vec![PendingAction::FreePage {
                page: id,
                unit: f.unit
            }]
        );
        assert!(f.buffer.space(CONTAINER).unwrap().is_used(id.block()));
    }
}
