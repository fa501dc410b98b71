//! The block allocator of one container.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use bracket_common::config::{extension_blocks, StorageConfig};
use bracket_common::constants::{
    BLOCK_HEADER_LENGTH, BLOCK_IN_USE, DATA_FILE_SUFFIX, META_FILE_SUFFIX, MIN_BLOCK_SIZE,
    RESERVED_BLOCK,
};
use bracket_common::types::{ContainerId, UnitId};

use super::bitmap::Bitmap;
use super::error::{StoreError, StoreResult};
use super::meta::SpaceMeta;
use crate::file::{write_file_atomic, DataFile};

/// Outcome of the crash-repair scan run by [`BlockSpace::open`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Blocks scanned in the data file.
    pub scanned_blocks: u32,
    /// Blocks found in use.
    pub used_blocks: u32,
    /// Unit bits dropped because the block marker was clear.
    pub dropped_unit_bits: usize,
    /// Used blocks that no unit owns. They stay allocated.
    pub orphan_blocks: Vec<u32>,
}

struct OpenSpace {
    data: DataFile,
    meta: SpaceMeta,
    /// First block the next automatic allocation looks at.
    hint: u32,
}

impl OpenSpace {
    fn size(&self) -> u32 {
        self.meta.bitmap.len() as u32
    }

    fn block_size(&self) -> usize {
        self.meta.block_size as usize
    }

    fn check_lba(&self, lba: u32) -> StoreResult<()> {
        if lba >= self.size() {
            return Err(StoreError::InvalidBlock {
                lba,
                size: self.size(),
            });
        }
        Ok(())
    }

    fn extend(&mut self, target: Option<u32>) -> StoreResult<u32> {
        let old = self.size();
        let new = target
            .unwrap_or_else(|| old.saturating_add(self.meta.ext_blocks))
            .max(old);
        if new == old {
            return Ok(old);
        }

        debug!(old_size = old, new_size = new, "extending block space");
        self.data
            .set_len(u64::from(new) * self.meta.block_size as u64)?;
        self.meta.bitmap.extend_to(new as usize);
        for bitmap in self.meta.units.values_mut() {
            bitmap.extend_to(new as usize);
        }
        self.meta.free_blocks += new - old;
        Ok(new)
    }

    fn set_marker(&self, lba: u32, marker: u8) -> StoreResult<()> {
        let offset = u64::from(lba) * self.meta.block_size as u64;
        self.data.write_all_at(&[marker], offset)?;
        Ok(())
    }

    fn mark_used(&mut self, lba: u32, unit: UnitId) {
        if !self.meta.bitmap.get(lba as usize) {
            self.meta.bitmap.set(lba as usize);
            self.meta.used_blocks += 1;
            self.meta.free_blocks = self.meta.free_blocks.saturating_sub(1);
        }
        for (id, bitmap) in &mut self.meta.units {
            if *id == unit {
                bitmap.set(lba as usize);
            } else {
                bitmap.clear(lba as usize);
            }
        }
    }

    fn mark_free(&mut self, lba: u32) -> StoreResult<()> {
        self.meta.bitmap.clear(lba as usize);
        self.meta.used_blocks = self.meta.used_blocks.saturating_sub(1);
        self.meta.free_blocks += 1;
        if self.hint > lba {
            self.hint = lba;
        }
        self.set_marker(lba, 0)
    }

    fn smallest_free_unit_id(&self) -> UnitId {
        let mut id = UnitId::FIRST.as_u32();
        while self.meta.units.contains_key(&UnitId::new(id)) {
            id += 1;
        }
        UnitId::new(id)
    }
}

/// Block allocator for one container.
///
/// Owns a data file of fixed-size blocks and a metadata catalog holding the
/// global free/used bitmap and the per-unit bitmaps. Block 0 is reserved.
///
/// All operations are serialized by one mutex per container.
///
/// # Example
///
/// ```rust,no_run
/// use bracket_common::types::{ContainerId, UnitId};
/// use bracket_storage::space::BlockSpace;
///
/// let space = BlockSpace::new("/tmp/store", ContainerId::new(1));
/// space.create(512, 16, 0.5).unwrap();
/// space.open().unwrap();
/// let unit = space.create_unit(None, false).unwrap();
/// let lba = space.allocate(None, unit, false).unwrap();
/// assert_eq!(lba, 1);
/// space.close().unwrap();
/// ```
pub struct BlockSpace {
    id: ContainerId,
    data_path: PathBuf,
    meta_path: PathBuf,
    state: Mutex<Option<OpenSpace>>,
    repair: Mutex<Option<RepairReport>>,
}

impl BlockSpace {
    /// Creates a handle for container `id` stored under `dir`. The space
    /// starts closed.
    pub fn new(dir: impl AsRef<Path>, id: ContainerId) -> Self {
        let dir = dir.as_ref();
        Self {
            id,
            data_path: dir.join(format!("{id}.{DATA_FILE_SUFFIX}")),
            meta_path: dir.join(format!("{id}.{META_FILE_SUFFIX}")),
            state: Mutex::new(None),
            repair: Mutex::new(None),
        }
    }

    /// Returns the container id.
    pub fn id(&self) -> ContainerId {
        self.id
    }

    /// Returns the data file path.
    pub fn path(&self) -> &Path {
        &self.data_path
    }

    /// Returns true if the space is closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().is_none()
    }

    /// Creates the data and metadata files, replacing existing ones.
    ///
    /// The space stays closed; call [`BlockSpace::open`] to use it.
    pub fn create(&self, block_size: usize, initial_blocks: u32, ratio: f64) -> StoreResult<()> {
        if self.state.lock().is_some() {
            return Err(StoreError::invalid_state("space already opened"));
        }
        if block_size < MIN_BLOCK_SIZE || block_size > u16::MAX as usize + 1 {
            return Err(StoreError::invalid_parameters(format!(
                "block size {block_size} outside {MIN_BLOCK_SIZE}..=65536"
            )));
        }
        if initial_blocks < 2 {
            return Err(StoreError::invalid_parameters(
                "a space needs at least 2 blocks, block 0 is reserved",
            ));
        }
        if ratio.is_nan() || ratio <= 0.0 {
            return Err(StoreError::invalid_parameters("extension ratio must be positive"));
        }
        if ratio > 1.0 {
            warn!(ratio, "extension ratio larger than 1.0");
        }

        if let Some(dir) = self.data_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        for path in [&self.data_path, &self.meta_path] {
            if path.exists() {
                warn!(path = %path.display(), "replacing existing container file");
                std::fs::remove_file(path)?;
            }
        }

        let data = DataFile::create(&self.data_path)?;
        data.set_len(u64::from(initial_blocks) * block_size as u64)?;
        data.sync_all()?;

        let mut bitmap = Bitmap::new(initial_blocks as usize);
        bitmap.set(RESERVED_BLOCK as usize);
        let meta = SpaceMeta {
            block_size: block_size as u32,
            initial_blocks,
            ext_blocks: extension_blocks(initial_blocks, ratio),
            consistent: true,
            bitmap,
            free_blocks: initial_blocks - 1,
            used_blocks: 1,
            next_unit_id: UnitId::FIRST.as_u32(),
            units: Default::default(),
        };
        write_file_atomic(&self.meta_path, &meta.encode())?;

        info!(
            container = %self.id,
            path = %self.data_path.display(),
            block_size,
            initial_blocks,
            ext_blocks = meta.ext_blocks,
            "created block space"
        );
        Ok(())
    }

    /// Creates the space from a storage configuration.
    pub fn create_with(&self, config: &StorageConfig) -> StoreResult<()> {
        self.create(
            config.block_size,
            config.initial_blocks,
            config.extension_ratio,
        )
    }

    /// Opens the space.
    ///
    /// If the catalog was not cleanly closed, the global bitmap is rebuilt
    /// from the block markers in the data file (see [`BlockSpace::repair_report`]).
    pub fn open(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(StoreError::invalid_state("space already opened"));
        }

        let bytes = std::fs::read(&self.meta_path)?;
        let mut meta = SpaceMeta::decode(&bytes)?;
        let data = DataFile::open(&self.data_path)?;

        if meta.consistent {
            *self.repair.lock() = None;
        } else {
            let report = Self::repair(&data, &mut meta)?;
            *self.repair.lock() = Some(report);
        }

        meta.consistent = false;
        write_file_atomic(&self.meta_path, &meta.encode())?;

        info!(
            container = %self.id,
            blocks = meta.bitmap.len(),
            used = meta.used_blocks,
            units = meta.units.len(),
            "opened block space"
        );
        *state = Some(OpenSpace {
            data,
            meta,
            hint: RESERVED_BLOCK + 1,
        });
        Ok(())
    }

    /// Rebuilds the global bitmap from block markers and reconciles units.
    fn repair(data: &DataFile, meta: &mut SpaceMeta) -> StoreResult<RepairReport> {
        let block_size = u64::from(meta.block_size);
        let blocks = (data.size()? / block_size) as u32;
        warn!(
            path = %data.path().display(),
            blocks,
            "repairing free space information after crash"
        );

        let mut bitmap = Bitmap::new(blocks.max(meta.bitmap.len() as u32) as usize);
        bitmap.set(RESERVED_BLOCK as usize);
        let mut marker = [0u8; BLOCK_HEADER_LENGTH];
        for lba in 1..blocks {
            data.read_exact_at(&mut marker, u64::from(lba) * block_size)?;
            if marker[0] != 0 {
                bitmap.set(lba as usize);
            }
        }

        let mut report = RepairReport {
            scanned_blocks: blocks,
            ..Default::default()
        };
        for unit_bits in meta.units.values_mut() {
            unit_bits.extend_to(bitmap.len());
            let stale: Vec<usize> = unit_bits.iter_ones().filter(|&i| !bitmap.get(i)).collect();
            report.dropped_unit_bits += stale.len();
            for i in stale {
                unit_bits.clear(i);
            }
        }
        for lba in bitmap.iter_ones().skip_while(|&i| i == RESERVED_BLOCK as usize) {
            if !meta.units.values().any(|u| u.get(lba)) {
                report.orphan_blocks.push(lba as u32);
            }
        }

        let used = bitmap.count_ones() as u32;
        report.used_blocks = used - 1;
        meta.free_blocks = bitmap.len() as u32 - used;
        meta.used_blocks = used;
        meta.bitmap = bitmap;

        if !report.orphan_blocks.is_empty() {
            warn!(
                orphans = report.orphan_blocks.len(),
                "used blocks without a unit after repair; unit membership cannot be rebuilt from block markers"
            );
        }
        Ok(report)
    }

    /// Result of the repair scan of the last `open`, if one ran.
    pub fn repair_report(&self) -> Option<RepairReport> {
        self.repair.lock().clone()
    }

    /// Syncs the data file and marks the catalog consistent.
    pub fn close(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        let Some(mut space) = state.take() else {
            return Err(StoreError::invalid_state("space already closed"));
        };

        space.data.sync_all()?;
        space.meta.consistent = true;
        write_file_atomic(&self.meta_path, &space.meta.encode())?;
        info!(container = %self.id, "closed block space");
        Ok(())
    }

    fn with_open<T>(&self, f: impl FnOnce(&mut OpenSpace) -> StoreResult<T>) -> StoreResult<T> {
        let mut state = self.state.lock();
        match state.as_mut() {
            Some(space) => f(space),
            None => Err(StoreError::invalid_state("block space is closed")),
        }
    }

    /// Creates a unit and returns its id.
    ///
    /// Without a requested id, the smallest unused positive id is assigned.
    /// Requesting an existing id fails unless `force` is set.
    pub fn create_unit(&self, requested: Option<UnitId>, force: bool) -> StoreResult<UnitId> {
        self.with_open(|space| {
            let unit = match requested {
                Some(unit) if !unit.is_valid() => {
                    return Err(StoreError::invalid_parameters("unit id 0 is reserved"));
                }
                Some(unit) if space.meta.units.contains_key(&unit) => {
                    if force {
                        return Ok(unit);
                    }
                    return Err(StoreError::UnitExists { unit });
                }
                Some(unit) => unit,
                None => space.smallest_free_unit_id(),
            };

            let bitmap = Bitmap::new(space.size() as usize);
            space.meta.units.insert(unit, bitmap);
            space.meta.next_unit_id = space.smallest_free_unit_id().as_u32();
            debug!(container = %self.id, %unit, "created unit");
            Ok(unit)
        })
    }

    /// Releases every block of `unit` and discards it. Returns the released
    /// blocks.
    pub fn drop_unit(&self, unit: UnitId, force: bool) -> StoreResult<Vec<u32>> {
        self.with_open(|space| {
            let Some(bitmap) = space.meta.units.remove(&unit) else {
                if force {
                    return Ok(Vec::new());
                }
                return Err(StoreError::UnitNotFound { unit });
            };

            let mut released = Vec::new();
            for lba in bitmap.iter_ones() {
                if space.meta.bitmap.get(lba) {
                    space.mark_free(lba as u32)?;
                    released.push(lba as u32);
                }
            }
            space.meta.next_unit_id = space.smallest_free_unit_id().as_u32();
            debug!(container = %self.id, %unit, released = released.len(), "dropped unit");
            Ok(released)
        })
    }

    /// Allocates a block for `unit`.
    ///
    /// With `Some(lba)` that block is taken, extending the space as needed;
    /// it must be free unless `force` is set. With `None` the first free
    /// block at or after the hint is taken, extending the space if there is
    /// none.
    pub fn allocate(&self, lba: Option<u32>, unit: UnitId, force: bool) -> StoreResult<u32> {
        self.with_open(|space| {
            if !space.meta.units.contains_key(&unit) {
                return Err(StoreError::UnitNotFound { unit });
            }

            let lba = match lba {
                Some(RESERVED_BLOCK) => {
                    return Err(StoreError::InvalidBlock {
                        lba: RESERVED_BLOCK,
                        size: space.size(),
                    });
                }
                Some(lba) => {
                    while lba >= space.size() {
                        space.extend(None)?;
                    }
                    if space.meta.bitmap.get(lba as usize) && !force {
                        return Err(StoreError::BlockInUse { lba });
                    }
                    lba
                }
                None => {
                    let found = if space.hint < space.size() {
                        space.meta.bitmap.next_clear(space.hint as usize)
                    } else {
                        None
                    };
                    match found {
                        Some(lba) => lba as u32,
                        None => {
                            let old = space.size();
                            space.extend(None)?;
                            space
                                .meta
                                .bitmap
                                .next_clear(old as usize)
                                .map(|lba| lba as u32)
                                .ok_or_else(|| StoreError::corrupt("no free block after extension"))?
                        }
                    }
                }
            };

            space.hint = lba + 1;
            space.mark_used(lba, unit);
            Ok(lba)
        })
    }

    /// Releases a block of `unit`.
    ///
    /// Without `force` the block must be in use and owned by `unit`. With
    /// `force` the block is removed from every unit holding it, which lets
    /// recovery release blocks whose unit membership is uncertain.
    pub fn release(&self, lba: u32, unit: UnitId, force: bool) -> StoreResult<()> {
        self.with_open(|space| {
            space.check_lba(lba)?;
            if lba == RESERVED_BLOCK {
                return Err(StoreError::InvalidBlock {
                    lba,
                    size: space.size(),
                });
            }

            if force {
                for bitmap in space.meta.units.values_mut() {
                    bitmap.clear(lba as usize);
                }
            } else {
                if !space.meta.bitmap.get(lba as usize) {
                    return Err(StoreError::BlockNotInUse { lba });
                }
                let bitmap = space
                    .meta
                    .units
                    .get_mut(&unit)
                    .ok_or(StoreError::UnitNotFound { unit })?;
                if !bitmap.get(lba as usize) {
                    return Err(StoreError::NotInUnit { lba, unit });
                }
                bitmap.clear(lba as usize);
            }

            if space.meta.bitmap.get(lba as usize) {
                space.mark_free(lba)?;
            }
            Ok(())
        })
    }

    /// Reads up to `count` blocks starting at `lba` into `buf`.
    ///
    /// Returns the number of contiguous used blocks actually read.
    pub fn read(&self, lba: u32, buf: &mut [u8], count: u32) -> StoreResult<u32> {
        self.with_open(|space| {
            space.check_lba(lba)?;
            if !space.meta.bitmap.get(lba as usize) {
                return Err(StoreError::BlockNotInUse { lba });
            }

            let mut run = 1;
            while run < count && space.meta.bitmap.get((lba + run) as usize) {
                run += 1;
            }

            let len = run as usize * space.block_size();
            if buf.len() < len {
                return Err(StoreError::BufferTooSmall {
                    needed: len,
                    available: buf.len(),
                });
            }
            let offset = u64::from(lba) * space.block_size() as u64;
            space.data.read_exact_at(&mut buf[..len], offset)?;
            Ok(run)
        })
    }

    /// Writes `count` blocks from `buf` starting at `lba`.
    ///
    /// The first byte of every written block is stamped with the in-use
    /// marker.
    pub fn write(&self, lba: u32, buf: &[u8], count: u32) -> StoreResult<()> {
        self.with_open(|space| {
            space.check_lba(lba)?;
            if count > 0 {
                space.check_lba(lba + count - 1)?;
            }

            let block_size = space.block_size();
            let len = count as usize * block_size;
            if buf.len() < len {
                return Err(StoreError::BufferTooSmall {
                    needed: len,
                    available: buf.len(),
                });
            }

            let mut blocks = buf[..len].to_vec();
            for block in blocks.chunks_mut(block_size) {
                block[0] = BLOCK_IN_USE;
            }
            let offset = u64::from(lba) * block_size as u64;
            space.data.write_all_at(&blocks, offset)?;
            Ok(())
        })
    }

    /// Persists the catalog. The space stays marked inconsistent until close.
    pub fn sync(&self) -> StoreResult<()> {
        self.with_open(|space| {
            write_file_atomic(&self.meta_path, &space.meta.encode())?;
            Ok(())
        })
    }

    /// Syncs the data file only.
    pub fn sync_data(&self) -> StoreResult<()> {
        self.with_open(|space| {
            space.data.sync_data()?;
            Ok(())
        })
    }

    /// Grows the space by one extension step, or to `target` blocks.
    /// Returns the new size. The space never shrinks.
    pub fn extend_store(&self, target: Option<u32>) -> StoreResult<u32> {
        self.with_open(|space| {
            let size = space.extend(target)?;
            write_file_atomic(&self.meta_path, &space.meta.encode())?;
            Ok(size)
        })
    }

    /// Returns true if `lba` is in use.
    pub fn is_used(&self, lba: u32) -> bool {
        self.state
            .lock()
            .as_ref()
            .is_some_and(|space| space.meta.bitmap.get(lba as usize))
    }

    /// Returns the block size.
    pub fn size_of_block(&self) -> StoreResult<usize> {
        self.with_open(|space| Ok(space.block_size()))
    }

    /// Returns the number of blocks in the space.
    pub fn block_count(&self) -> StoreResult<u32> {
        self.with_open(|space| Ok(space.size()))
    }

    /// Returns the number of used blocks, counting the reserved block 0.
    ///
    /// `used_blocks() + free_blocks()` is always the block count.
    pub fn used_blocks(&self) -> StoreResult<u32> {
        self.with_open(|space| Ok(space.meta.used_blocks))
    }

    /// Returns the number of free blocks.
    pub fn free_blocks(&self) -> StoreResult<u32> {
        self.with_open(|space| Ok(space.meta.free_blocks))
    }

    /// Returns the ids of all units.
    pub fn unit_ids(&self) -> StoreResult<Vec<UnitId>> {
        self.with_open(|space| Ok(space.meta.units.keys().copied().collect()))
    }

    /// Returns true if `unit` exists.
    pub fn has_unit(&self, unit: UnitId) -> bool {
        self.state
            .lock()
            .as_ref()
            .is_some_and(|space| space.meta.units.contains_key(&unit))
    }

    /// Returns the blocks owned by `unit`.
    pub fn unit_blocks(&self, unit: UnitId) -> StoreResult<Vec<u32>> {
        self.with_open(|space| {
            let bitmap = space
                .meta
                .units
                .get(&unit)
                .ok_or(StoreError::UnitNotFound { unit })?;
            Ok(bitmap.iter_ones().map(|lba| lba as u32).collect())
        })
    }

    /// Returns the unit owning `lba`, if any.
    pub fn owner_of(&self, lba: u32) -> Option<UnitId> {
        let state = self.state.lock();
        let space = state.as_ref()?;
        space
            .meta
            .units
            .iter()
            .find(|(_, bitmap)| bitmap.get(lba as usize))
            .map(|(unit, _)| *unit)
    }

    /// One-line description for diagnostics.
    pub fn info(&self) -> String {
        let state = self.state.lock();
        match state.as_ref() {
            Some(space) => {
                let blocks = u64::from(space.size());
                let used = u64::from(space.meta.used_blocks.saturating_sub(1));
                let block_size = u64::from(space.meta.block_size);
                format!(
                    "#{} {} ({}KB), {}B blocks, total {}, used {} ({}%)",
                    self.id,
                    self.data_path.display(),
                    blocks * block_size / 1024,
                    block_size,
                    blocks - 1,
                    used,
                    used * 100 / blocks
                )
            }
            None => format!("#{} {} (closed)", self.id, self.data_path.display()),
        }
    }
}

impl std::fmt::Debug for BlockSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockSpace")
            .field("id", &self.id)
            .field("path", &self.data_path)
            .field("closed", &self.is_closed())
            .finish()
    }
}
