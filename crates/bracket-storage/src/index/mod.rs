//! Bracket index: a B+-tree of node records keyed by DeweyIDs.
//!
//! All records live in leaves chained in key order; branches only route.
//! Each leaf carries a high key, the exclusive upper bound of the keys that
//! route to it, so a cursor can tell whether a key belongs to its leaf
//! without going back to the root.
//!
//! # Page layout
//!
//! ```text
//!                     ┌──────────────────────┐
//!                     │ root (branch, h=1)   │  low ──► L1
//!                     │ 1.5 ──► L2  3 ──► L3 │
//!                     └──────────────────────┘
//!                        /        |        \
//!   ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//!   │ L1           │─►│ L2           │─►│ L3           │─► None
//!   │ 1 1.0.1 1.1  │◄─│ 1.5 1.6 2    │◄─│ 3 3.1        │
//!   │ high = 1.5   │  │ high = 3     │  │ high = none  │
//!   └──────────────┘  └──────────────┘  └──────────────┘
//! ```
//!
//! The root page never moves: when it splits, its content is copied into a
//! new child and the root is reformatted one level higher.
//!
//! # Concurrency
//!
//! Readers couple shared latches top-down and left-to-right. Structure
//! modifications latch the whole path exclusively from the root. Moving left
//! only ever uses a conditional latch, and cursors release their leaf before
//! any operation that could restructure the tree.

mod error;
mod iter;
mod navigation;
mod tree;

use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use bracket_common::config::StorageConfig;
use bracket_common::types::{ContainerId, DeweyId, NodeRecord, PageId, UnitId};
use bracket_wal::Tx;

pub use error::{IndexAccessError, IndexOperationError, IndexResult, Phase};
pub use iter::{BracketIter, HintPageInformation, SubtreeStream};
pub use navigation::{NavigationMode, NavigationStatus, OpenMode};
pub use tree::VerifyReport;

pub(crate) use tree::{BracketTree, Compensation, LogAs};

use crate::buffer::BufferManager;
use tree::{Navigated, TreeOptions};

/// Entry point for creating, reading and modifying bracket indexes.
///
/// Indexes are identified by their root page. Reads take no transaction;
/// every modification is logged on behalf of the given [`Tx`].
#[derive(Debug, Clone)]
pub struct BracketIndex {
    tree: BracketTree,
}

impl BracketIndex {
    /// Creates the index layer over `buffer`.
    pub fn new(buffer: Arc<BufferManager>, config: &StorageConfig) -> Self {
        let options = TreeOptions {
            split_occupancy: config.split_occupancy,
            externalize_fraction: config.externalize_fraction,
        };
        Self {
            tree: BracketTree::new(buffer, options),
        }
    }

    /// Creates an empty index in `container` and returns its root page.
    ///
    /// Without a unit the index gets a unit of its own, which
    /// [`BracketIndex::drop_index`] releases with all its pages.
    pub fn create_index(
        &self,
        tx: &Tx,
        container: ContainerId,
        unit: Option<UnitId>,
    ) -> IndexResult<PageId> {
        self.tree.create_index(tx, container, unit)
    }

    /// Drops the index when `tx` commits.
    pub fn drop_index(&self, tx: &Tx, root: PageId) -> IndexResult<()> {
        self.tree.drop_index(tx, root)
    }

    /// Opens a cursor on the record `mode` reaches from `key`.
    ///
    /// Returns `None` if there is no such record. A hint is only accepted
    /// with [`NavigationMode::ToKey`]; a stale hint falls back to a descent.
    pub fn open(
        &self,
        root: PageId,
        mode: NavigationMode,
        key: &DeweyId,
        open_mode: OpenMode,
        hint: Option<&HintPageInformation>,
    ) -> IndexResult<Option<BracketIter>> {
        let latch = open_mode.latch();
        let found = match hint {
            Some(_) if mode != NavigationMode::ToKey => {
                return Err(IndexOperationError::InvalidNavigation {
                    mode,
                    reason: "a hint can only be used to open at a key",
                })
            }
            Some(hint) => self.tree.seek_hinted(root, key, hint, latch)?,
            None => match self.tree.navigate(root, mode, key, latch)? {
                Navigated::Found(guard, slot) => Some((guard, slot)),
                Navigated::Missing(status) => {
                    trace!(%root, %key, ?mode, ?status, "nothing to open");
                    None
                }
            },
        };
        Ok(found.map(|(guard, slot)| BracketIter::new(self.tree.clone(), root, open_mode, guard, slot)))
    }

    /// Value stored under `key`.
    pub fn get(&self, root: PageId, key: &DeweyId) -> IndexResult<Option<Bytes>> {
        match self.tree.get(root, key)? {
            Some(record) => Ok(Some(self.tree.resolve_value(&record)?)),
            None => Ok(None),
        }
    }

    /// Inserts a new record.
    pub fn insert(
        &self,
        tx: &Tx,
        root: PageId,
        key: &DeweyId,
        value: impl Into<Bytes>,
    ) -> IndexResult<()> {
        let record = self.tree.prepare_record(tx, root, key, value.into())?;
        if let Err(err) = self.tree.insert(tx, root, record.clone()) {
            self.tree.discard_prepared(tx, root, &record);
            return Err(err);
        }
        Ok(())
    }

    /// Inserts records whose keys are strictly increasing, filling each leaf
    /// with as many as fit in one log record.
    pub fn insert_sequence(
        &self,
        tx: &Tx,
        root: PageId,
        entries: &[(DeweyId, Bytes)],
    ) -> IndexResult<()> {
        for pair in entries.windows(2) {
            if pair[1].0 <= pair[0].0 {
                return Err(IndexOperationError::UnorderedSequence {
                    previous: pair[0].0.clone(),
                    key: pair[1].0.clone(),
                });
            }
        }

        let mut records: Vec<NodeRecord> = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match self.tree.prepare_record(tx, root, key, value.clone()) {
                Ok(record) => records.push(record),
                Err(err) => {
                    for record in &records {
                        self.tree.discard_prepared(tx, root, record);
                    }
                    return Err(err);
                }
            }
        }

        let mut inserted = 0;
        if let Err(err) = self.tree.insert_sequence(tx, root, &records, &mut inserted) {
            for record in &records[inserted..] {
                self.tree.discard_prepared(tx, root, record);
            }
            return Err(err);
        }
        debug!(txn = %tx.id(), %root, count = records.len(), "inserted sequence");
        Ok(())
    }

    /// Replaces the value of an existing record.
    pub fn update(
        &self,
        tx: &Tx,
        root: PageId,
        key: &DeweyId,
        value: impl Into<Bytes>,
    ) -> IndexResult<()> {
        let record = self.tree.prepare_record(tx, root, key, value.into())?;
        if let Err(err) = self.tree.update(tx, root, record.clone()) {
            self.tree.discard_prepared(tx, root, &record);
            return Err(err);
        }
        Ok(())
    }

    /// Deletes one record.
    pub fn delete(&self, tx: &Tx, root: PageId, key: &DeweyId) -> IndexResult<()> {
        self.tree.delete(tx, root, key)?;
        Ok(())
    }

    /// Deletes `key` and all its descendants. Returns the number of records
    /// deleted.
    pub fn delete_subtree(&self, tx: &Tx, root: PageId, key: &DeweyId) -> IndexResult<usize> {
        let bound = key.subtree_bound();
        let deleted = self
            .tree
            .delete_range(tx, root, key, Bound::Excluded(&bound))?;
        if deleted == 0 {
            return Err(IndexOperationError::KeyNotFound {
                root,
                key: key.clone(),
            });
        }
        Ok(deleted)
    }

    /// Deletes every record from `left` to `right`, both included. Returns
    /// the number of records deleted.
    pub fn delete_sequence(
        &self,
        tx: &Tx,
        root: PageId,
        left: &DeweyId,
        right: &DeweyId,
    ) -> IndexResult<usize> {
        if right < left {
            return Err(IndexOperationError::UnorderedSequence {
                previous: left.clone(),
                key: right.clone(),
            });
        }
        self.tree
            .delete_range(tx, root, left, Bound::Included(right))
    }

    /// Streams the subtree of `key`, optionally without `key` itself.
    pub fn subtree(&self, root: PageId, key: &DeweyId, include_self: bool) -> SubtreeStream {
        SubtreeStream::new(self.tree.clone(), root, key, include_self)
    }

    /// Checks the structure of the index.
    pub fn verify(&self, root: PageId) -> IndexResult<VerifyReport> {
        self.tree.verify(root)
    }

    /// Writes a page-by-page description of the index.
    pub fn dump(&self, root: PageId, out: &mut dyn fmt::Write) -> IndexResult<()> {
        self.tree.dump(root, out)
    }

    pub(crate) fn tree(&self) -> &BracketTree {
        &self.tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{BlockSpace, ContainerRegistry};
    use bracket_common::types::TxnId;
    use bracket_wal::LogManager;
    use tempfile::TempDir;

    const CONTAINER: ContainerId = ContainerId::new(1);

    fn setup(block_size: usize) -> (TempDir, BracketIndex, Arc<LogManager>) {
        let dir = tempfile::tempdir().unwrap();
        let space = Arc::new(BlockSpace::new(dir.path(), CONTAINER));
        space.create(block_size, 8, 1.0).unwrap();
        space.open().unwrap();
        let registry = Arc::new(ContainerRegistry::new());
        registry.register(space).unwrap();
        let log = Arc::new(LogManager::in_memory());
        let buffer = Arc::new(BufferManager::new(registry, Arc::clone(&log), 64));
        let config = StorageConfig {
            block_size,
            ..StorageConfig::default()
        };
        (dir, BracketIndex::new(buffer, &config), log)
    }

    fn key(s: &str) -> DeweyId {
        s.parse().unwrap()
    }

    #[test]
    fn test_insert_get_update_delete() {
        let (_dir, index, log) = setup(512);
        let tx = Tx::new(TxnId::new(1), log);
        let root = index.create_index(&tx, CONTAINER, None).unwrap();

        index.insert(&tx, root, &key("1"), "doc").unwrap();
        index.insert(&tx, root, &key("1.1"), "child").unwrap();
        assert!(index
            .insert(&tx, root, &key("1.1"), "again")
            .unwrap_err()
            .is_duplicate_key());

        index.update(&tx, root, &key("1.1"), "changed").unwrap();
        assert_eq!(index.get(root, &key("1.1")).unwrap().unwrap(), "changed");

        index.delete(&tx, root, &key("1")).unwrap();
        assert_eq!(index.get(root, &key("1")).unwrap(), None);
        assert!(index
            .delete(&tx, root, &key("1"))
            .unwrap_err()
            .is_key_not_found());
    }

    #[test]
    fn test_long_value_is_externalized() {
        let (_dir, index, log) = setup(512);
        let tx = Tx::new(TxnId::new(1), log);
        let root = index.create_index(&tx, CONTAINER, None).unwrap();

        let long = Bytes::from(vec![42u8; 1500]);
        index.insert(&tx, root, &key("1"), long.clone()).unwrap();
        let record = index.tree().get(root, &key("1")).unwrap().unwrap();
        assert!(record.external);
        assert_eq!(index.get(root, &key("1")).unwrap().unwrap(), long);
    }

    #[test]
    fn test_hint_requires_to_key() {
        let (_dir, index, log) = setup(512);
        let tx = Tx::new(TxnId::new(1), log);
        let root = index.create_index(&tx, CONTAINER, None).unwrap();
        index.insert(&tx, root, &key("1"), "a").unwrap();

        let cursor = index
            .open(root, NavigationMode::ToKey, &key("1"), OpenMode::Read, None)
            .unwrap()
            .unwrap();
        let hint = cursor.hint().unwrap();
        drop(cursor);

        let err = index
            .open(root, NavigationMode::First, &key("1"), OpenMode::Read, Some(&hint))
            .unwrap_err();
        assert!(matches!(err, IndexOperationError::InvalidNavigation { .. }));

        let cursor = index
            .open(root, NavigationMode::ToKey, &key("1"), OpenMode::Read, Some(&hint))
            .unwrap()
            .unwrap();
        assert_eq!(cursor.key(), Some(key("1")));
    }

    #[test]
    fn test_sequence_must_be_ordered() {
        let (_dir, index, log) = setup(512);
        let tx = Tx::new(TxnId::new(1), log);
        let root = index.create_index(&tx, CONTAINER, None).unwrap();

        let entries = vec![
            (key("1.2"), Bytes::from_static(b"b")),
            (key("1.1"), Bytes::from_static(b"a")),
        ];
        let err = index.insert_sequence(&tx, root, &entries).unwrap_err();
        assert!(matches!(err, IndexOperationError::UnorderedSequence { .. }));
        assert_eq!(index.verify(root).unwrap().records, 0);
    }
}
