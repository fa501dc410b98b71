//! Redo and undo handlers for single log records.
//!
//! Redo is physical and idempotent: page operations are skipped when the
//! page LSN already covers the record, allocator operations are forced into
//! the state the record describes.
//!
//! Undo of record changes is logical: the record is looked up again through
//! the tree, since splits by other transactions may have moved it. Anything
//! else (allocations, pointers, the pieces of an unfinished structure
//! modification) is undone physically on the page it names.

use std::collections::BTreeMap;

use tracing::{trace, warn};

use bracket_common::types::{ContainerId, Lsn, PageId, UnitId};
use bracket_wal::{LogError, LogOperation, LogRecord, Tx};

use crate::buffer::{BufferManager, LatchMode};
use crate::index::{
    BracketTree, Compensation, IndexAccessError, IndexOperationError, IndexResult, LogAs, Phase,
};
use crate::page::TreeContext;

/// Replays one record. Returns false if there was nothing to do.
pub(crate) fn redo(buffer: &BufferManager, record: &LogRecord) -> IndexResult<bool> {
    match &record.op {
        LogOperation::Commit | LogOperation::Abort | LogOperation::SmoEnd => Ok(false),
        LogOperation::Allocate { page, unit } => {
            let space = buffer.space(page.container_id())?;
            if space.is_used(page.block()) && space.owner_of(page.block()) == Some(*unit) {
                return Ok(false);
            }
            space.allocate(Some(page.block()), *unit, true)?;
            Ok(true)
        }
        LogOperation::Deallocate { page, unit } => {
            let space = buffer.space(page.container_id())?;
            if !space.is_used(page.block()) {
                return Ok(false);
            }
            buffer.drop_frame(*page);
            space.release(page.block(), *unit, true)?;
            Ok(true)
        }
        LogOperation::CreateUnit { container, unit } => {
            let space = buffer.space(*container)?;
            if space.has_unit(*unit) {
                return Ok(false);
            }
            space.create_unit(Some(*unit), true)?;
            Ok(true)
        }
        LogOperation::DropUnit { container, unit } => {
            drop_unit(buffer, *container, *unit, true)?;
            Ok(true)
        }
        LogOperation::DeallocateDeferred {
            container,
            pages,
            units,
        } => {
            release_deferred(buffer, *container, pages, units, true)?;
            Ok(true)
        }
        op => redo_page(buffer, record.lsn, op),
    }
}

fn redo_page(buffer: &BufferManager, lsn: Lsn, op: &LogOperation) -> IndexResult<bool> {
    let Some(page) = op.page_id() else {
        return Ok(false);
    };
    let mut guard = match buffer.fix_page(page, LatchMode::Update) {
        Ok(guard) => guard,
        Err(err) if err.is_page_deleted() => {
            trace!(%page, %lsn, "page no longer allocated, nothing to redo");
            return Ok(false);
        }
        Err(err) => return Err(err.into()),
    };
    if guard.page().lsn() >= lsn {
        trace!(%page, %lsn, "page already current");
        return Ok(false);
    }
    check_root(&guard.page(), op, Phase::Redo)?;
    guard.up_x();
    guard.page_mut().apply(op)?;
    guard.page_mut().set_lsn(lsn);
    Ok(true)
}

/// Rolls back one undoable record on behalf of `tx`, logging compensation
/// records that continue at `record.prev_lsn`.
pub(crate) fn undo(tree: &BracketTree, tx: &Tx, record: &LogRecord) -> IndexResult<()> {
    let undo_next = record.prev_lsn;
    let logical = |root: PageId, steps: Vec<Compensation>| -> IndexResult<()> {
        // every step but the last resumes at this record, so a crash between
        // steps repeats them; repeated steps only log dummy compensations
        let count = steps.len();
        for (i, step) in steps.iter().enumerate() {
            let next = if i + 1 == count { undo_next } else { record.lsn };
            tree.compensate(tx, root, step, next)
                .map_err(|err| in_phase(err, Phase::Undo))?;
        }
        Ok(())
    };

    match &record.op {
        LogOperation::LeafInsert { root, record: rec, .. } => {
            logical(*root, vec![Compensation::Remove(rec.clone())])
        }
        LogOperation::LeafDelete { root, record: rec, .. } => {
            logical(*root, vec![Compensation::Restore(rec.clone())])
        }
        LogOperation::LeafUpdate { root, old, .. } => {
            logical(*root, vec![Compensation::Revert(old.clone())])
        }
        LogOperation::SequenceInsert { root, records, .. } => logical(
            *root,
            records
                .iter()
                .rev()
                .cloned()
                .map(Compensation::Remove)
                .collect(),
        ),
        LogOperation::SequenceDelete { root, records, .. } => logical(
            *root,
            records.iter().cloned().map(Compensation::Restore).collect(),
        ),
        op => undo_physical(tree, tx, op, undo_next),
    }
}

fn undo_physical(
    tree: &BracketTree,
    tx: &Tx,
    op: &LogOperation,
    undo_next: Lsn,
) -> IndexResult<()> {
    let buffer = tree.buffer();
    let Some(inverse) = op.inverse() else {
        return Ok(());
    };
    match op {
        LogOperation::Allocate { page, unit } => {
            tx.log_clr(inverse, undo_next)?;
            let space = buffer.space(page.container_id())?;
            buffer.drop_frame(*page);
            if space.is_used(page.block()) {
                space.release(page.block(), *unit, true)?;
            }
        }
        LogOperation::Deallocate { page, unit } => {
            tx.log_clr(inverse, undo_next)?;
            buffer
                .space(page.container_id())?
                .allocate(Some(page.block()), *unit, true)?;
        }
        LogOperation::CreateUnit { container, unit } => {
            tx.log_clr(inverse, undo_next)?;
            drop_unit(buffer, *container, *unit, true)?;
        }
        LogOperation::DropUnit { container, unit } => {
            tx.log_clr(inverse, undo_next)?;
            buffer.space(*container)?.create_unit(Some(*unit), true)?;
        }
        _ => {
            let page = op
                .page_id()
                .ok_or_else(|| LogError::undo(op, "operation names no page"))?;
            let mut guard = buffer.fix_page(page, LatchMode::Exclusive).map_err(|err| {
                if err.is_page_deleted() {
                    IndexOperationError::from(IndexAccessError::PageDeleted { page })
                } else {
                    err.into()
                }
            })?;
            check_root(&guard.page(), op, Phase::Undo)?;
            tree.apply_logged(tx, &mut guard, inverse, LogAs::Compensation(undo_next))?;
        }
    }
    Ok(())
}

/// Releases the pages and units collected at commit.
///
/// With `force` the release tolerates pages and units that are already gone,
/// as they may be when the record is replayed.
pub(crate) fn release_deferred(
    buffer: &BufferManager,
    container: ContainerId,
    pages: &[(PageId, UnitId)],
    units: &[UnitId],
    force: bool,
) -> IndexResult<()> {
    let space = buffer.space(container)?;
    for (page, unit) in pages {
        buffer.drop_frame(*page);
        if force && !space.is_used(page.block()) {
            continue;
        }
        space.release(page.block(), *unit, force)?;
    }
    for unit in units {
        drop_unit(buffer, container, *unit, force)?;
    }
    Ok(())
}

/// Groups queued page and unit releases by container.
pub(crate) type DeferredReleases = BTreeMap<ContainerId, (Vec<(PageId, UnitId)>, Vec<UnitId>)>;

fn drop_unit(
    buffer: &BufferManager,
    container: ContainerId,
    unit: UnitId,
    force: bool,
) -> IndexResult<()> {
    let space = buffer.space(container)?;
    if !space.has_unit(unit) {
        if force {
            return Ok(());
        }
        warn!(%container, %unit, "unit to drop does not exist");
    }
    for block in space.unit_blocks(unit).unwrap_or_default() {
        buffer.drop_frame(PageId::new(container.as_u32(), block));
    }
    space.drop_unit(unit, force)?;
    Ok(())
}

fn check_root(page: &crate::page::Page, op: &LogOperation, during: Phase) -> IndexResult<()> {
    let (Some(expected), Some(context)) = (op.root_page_id(), page.context()) else {
        return Ok(());
    };
    // a format record names the root the page gets, not the one it had
    if matches!(op, LogOperation::Format { .. }) && during == Phase::Redo {
        return Ok(());
    }
    let found = context.root();
    if found != expected {
        return Err(IndexAccessError::RootMismatch {
            page: page.id(),
            expected,
            found,
            during,
        }
        .into());
    }
    Ok(())
}

/// Tags a root mismatch met while replaying with the recovery phase.
fn in_phase(err: IndexOperationError, during: Phase) -> IndexOperationError {
    match err {
        IndexOperationError::RootMismatch {
            page,
            expected,
            found,
        } => IndexAccessError::RootMismatch {
            page,
            expected,
            found,
            during,
        }
        .into(),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Page;
    use bracket_common::types::{DeweyId, NodeRecord, PageKind};
    use bracket_wal::{FormatState, PointerField};

    fn page_id(block: u32) -> PageId {
        PageId::new(1, block)
    }

    fn leaf_page() -> Page {
        let mut page = Page::new(page_id(2), UnitId::new(1), 512);
        page.format(FormatState {
            kind: PageKind::Leaf,
            unit: UnitId::new(1),
            root: page_id(2),
            height: 0,
        });
        page
    }

    fn record(key: &str) -> NodeRecord {
        NodeRecord::new(key.parse::<DeweyId>().unwrap(), &b"value"[..])
    }

    #[test]
    fn test_inverse_restores_page_content() {
        let root = page_id(2);
        let ops = vec![
            LogOperation::LeafInsert {
                page: root,
                root,
                record: record("1.3"),
            },
            LogOperation::SequenceInsert {
                page: root,
                root,
                records: vec![record("1.4"), record("1.5")],
            },
            LogOperation::LeafUpdate {
                page: root,
                root,
                old: record("1.1"),
                new: NodeRecord::new("1.1".parse().unwrap(), &b"longer value"[..]),
            },
            LogOperation::HighKeyUpdate {
                page: root,
                root,
                old: None,
                new: Some("2".parse().unwrap()),
            },
            LogOperation::Pointer {
                field: PointerField::Next,
                page: root,
                root,
                old: None,
                new: Some(page_id(7)),
            },
        ];

        for op in ops {
            let mut page = leaf_page();
            page.apply(&LogOperation::LeafInsert {
                page: root,
                root,
                record: record("1.1"),
            })
            .unwrap();
            let before = page.clone();
            page.apply(&op).unwrap();
            assert_ne!(page, before, "{op} changed nothing");
            page.apply(&op.inverse().unwrap()).unwrap();
            assert_eq!(page, before, "{op} was not reversed");
        }
    }

    #[test]
    fn test_root_check() {
        let page = leaf_page();
        let foreign = LogOperation::LeafInsert {
            page: page_id(2),
            root: page_id(9),
            record: record("1"),
        };
        let err = check_root(&page, &foreign, Phase::Undo).unwrap_err();
        assert!(err.is_unrecoverable());
        assert!(!check_root(&page, &foreign, Phase::Redo)
            .unwrap_err()
            .is_unrecoverable());

        let own = LogOperation::LeafInsert {
            page: page_id(2),
            root: page_id(2),
            record: record("1"),
        };
        assert!(check_root(&page, &own, Phase::Undo).is_ok());
    }

    #[test]
    fn test_in_phase_tags_mismatch() {
        let err = in_phase(
            IndexOperationError::RootMismatch {
                page: page_id(3),
                expected: page_id(2),
                found: page_id(4),
            },
            Phase::Undo,
        );
        assert!(err.is_unrecoverable());
        assert!(!in_phase(IndexOperationError::NotPositioned, Phase::Undo).is_unrecoverable());
    }
}
