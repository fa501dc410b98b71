//! Externalized values.
//!
//! A value too long for a leaf lives in a chain of blob pages owned by the
//! same unit as the index; the leaf record keeps only the first page id.
//!
//! ```text
//!   leaf record (external) ──► blob ──► blob ──► blob ──► None
//! ```
//!
//! Blob pages are not logged beyond their allocation. [`BlobStore::write`]
//! forces every link to disk before it returns, so a committed record never
//! references bytes that only lived in the buffer.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use bracket_common::types::{ContainerId, PageId, UnitId};
use bracket_wal::{LogOperation, PendingAction, Tx};

use crate::buffer::{BufferManager, BufferResult, LatchMode};
use crate::page::BlobPage;

/// Reads and writes blob chains through the buffer.
#[derive(Debug, Clone)]
pub struct BlobStore {
    buffer: Arc<BufferManager>,
}

impl BlobStore {
    /// Creates a blob store over `buffer`.
    pub fn new(buffer: Arc<BufferManager>) -> Self {
        Self { buffer }
    }

    /// Allocates the first page of a new, empty chain.
    pub fn create(&self, tx: &Tx, container: ContainerId, unit: UnitId) -> BufferResult<PageId> {
        let mut guard = self.buffer.create_page(tx, container, unit)?;
        guard.page_mut().set_blob(BlobPage {
            next: None,
            data: Bytes::new(),
        })?;
        Ok(guard.page_id())
    }

    /// Allocates a chain and writes `value` into it. Returns the first page.
    pub fn store(
        &self,
        tx: &Tx,
        container: ContainerId,
        unit: UnitId,
        value: &[u8],
    ) -> BufferResult<PageId> {
        let first = self.create(tx, container, unit)?;
        self.write(tx, first, value)?;
        Ok(first)
    }

    /// Replaces the content of the chain starting at `first`.
    ///
    /// Existing links are reused, missing ones allocated and surplus ones
    /// released immediately.
    pub fn write(&self, tx: &Tx, first: PageId, value: &[u8]) -> BufferResult<()> {
        let container = first.container_id();
        let capacity = BlobPage::capacity(self.buffer.block_size(container)?);
        let mut chunks: Vec<&[u8]> = value.chunks(capacity.max(1)).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }

        let mut current = first;
        for (i, chunk) in chunks.iter().enumerate() {
            let mut guard = self.buffer.fix_page(current, LatchMode::Exclusive)?;
            let unit = guard.page().unit();
            let old_next = guard.page().blob()?.next;

            let next = if i + 1 == chunks.len() {
                if let Some(surplus) = old_next {
                    self.drop_now(tx, surplus, unit)?;
                }
                None
            } else {
                match old_next {
                    Some(next) => Some(next),
                    None => {
                        let mut link = self.buffer.create_page(tx, container, unit)?;
                        link.page_mut().set_blob(BlobPage {
                            next: None,
                            data: Bytes::new(),
                        })?;
                        Some(link.page_id())
                    }
                }
            };

            guard.page_mut().set_blob(BlobPage {
                next,
                data: Bytes::copy_from_slice(chunk),
            })?;
            // blob content is not logged, it goes to disk before the record
            // that references it
            guard.down_s();
            self.buffer.flush_guarded(&guard)?;
            drop(guard);
            if let Some(next) = next {
                current = next;
            }
        }
        trace!(txn = %tx.id(), %first, pages = chunks.len(), len = value.len(), "wrote blob");
        Ok(())
    }

    /// Reads the whole value of the chain starting at `first`.
    pub fn read(&self, first: PageId) -> BufferResult<Bytes> {
        let mut value = BytesMut::new();
        let mut current = Some(first);
        while let Some(page) = current {
            let guard = self.buffer.fix_page(page, LatchMode::Shared)?;
            let page = guard.page();
            let blob = page.blob()?;
            value.extend_from_slice(&blob.data);
            current = blob.next;
        }
        Ok(value.freeze())
    }

    /// Page ids of the chain starting at `first`, in chain order.
    pub fn chain_pages(&self, first: PageId) -> BufferResult<Vec<PageId>> {
        let mut pages = Vec::new();
        let mut current = Some(first);
        while let Some(page) = current {
            let guard = self.buffer.fix_page(page, LatchMode::Shared)?;
            current = guard.page().blob()?.next;
            pages.push(page);
        }
        Ok(pages)
    }

    /// Schedules the chain for deallocation when `tx` commits.
    pub fn drop(&self, tx: &Tx, first: PageId, unit: UnitId) {
        tx.add_pending(PendingAction::DropBlob { page: first, unit });
    }

    /// Releases the chain right away, logging one deallocation per page.
    ///
    /// Only for chains the same transaction created, such as the value of an
    /// insert that failed.
    pub fn drop_now(&self, tx: &Tx, first: PageId, unit: UnitId) -> BufferResult<()> {
        let pages = self.chain_pages(first)?;
        let space = self.buffer.space(first.container_id())?;
        for page in &pages {
            tx.log_update(LogOperation::Deallocate { page: *page, unit })?;
            self.buffer.drop_frame(*page);
            space.release(page.block(), unit, false)?;
        }
        debug!(txn = %tx.id(), %first, pages = pages.len(), "dropped blob");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PAGE_HEADER_SIZE;
    use crate::space::{BlockSpace, ContainerRegistry};
    use bracket_common::types::TxnId;
    use bracket_wal::LogManager;
    use tempfile::TempDir;

    const CONTAINER: ContainerId = ContainerId::new(1);

    fn setup() -> (TempDir, BlobStore, Arc<BufferManager>, Tx, UnitId) {
        let dir = tempfile::tempdir().unwrap();
        let space = Arc::new(BlockSpace::new(dir.path(), CONTAINER));
        space.create(256, 8, 1.0).unwrap();
        space.open().unwrap();
        let unit = space.create_unit(None, false).unwrap();
        let registry = Arc::new(ContainerRegistry::new());
        registry.register(space).unwrap();
        let log = Arc::new(LogManager::in_memory());
        let buffer = Arc::new(BufferManager::new(registry, Arc::clone(&log), 16));
        let tx = Tx::new(TxnId::new(1), log);
        (dir, BlobStore::new(Arc::clone(&buffer)), buffer, tx, unit)
    }

    #[test]
    fn test_store_and_read_multi_page() {
        let (_dir, blobs, buffer, tx, unit) = setup();
        let value: Vec<u8> = (0..700u32).map(|i| (i % 251) as u8).collect();
        let first = blobs.store(&tx, CONTAINER, unit, &value).unwrap();

        let per_page = 256 - PAGE_HEADER_SIZE - 12;
        let expected_pages = value.len().div_ceil(per_page);
        assert_eq!(blobs.chain_pages(first).unwrap().len(), expected_pages);

        buffer.discard_all();
        assert_eq!(&blobs.read(first).unwrap()[..], &value[..]);
    }

    #[test]
    fn test_rewrite_releases_surplus() {
        let (_dir, blobs, buffer, tx, unit) = setup();
        let first = blobs.store(&tx, CONTAINER, unit, &[7u8; 600]).unwrap();
        let pages = blobs.chain_pages(first).unwrap();
        assert!(pages.len() > 1);

        blobs.write(&tx, first, b"short").unwrap();
        assert_eq!(blobs.chain_pages(first).unwrap(), vec![first]);
        assert_eq!(&blobs.read(first).unwrap()[..], b"short");

        let space = buffer.space(CONTAINER).unwrap();
        assert!(pages[1..].iter().all(|p| !space.is_used(p.block())));
    }

    #[test]
    fn test_drop_now_and_deferred_drop() {
        let (_dir, blobs, buffer, tx, unit) = setup();
        let first = blobs.store(&tx, CONTAINER, unit, b"gone").unwrap();
        blobs.drop_now(&tx, first, unit).unwrap();
        assert!(!buffer.space(CONTAINER).unwrap().is_used(first.block()));

        let kept = blobs.store(&tx, CONTAINER, unit, b"later").unwrap();
        blobs.drop(&tx, kept, unit);
        assert_eq!(tx.pending_count(), 1);
        assert!(buffer.space(CONTAINER).unwrap().is_used(kept.block()));
    }
}
