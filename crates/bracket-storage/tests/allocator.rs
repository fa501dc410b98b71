//! Block allocator scenarios across units, extension and reopen.

use std::collections::BTreeSet;

use bracket_common::types::{ContainerId, UnitId};
use bracket_storage::BlockSpace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn open_space(dir: &std::path::Path) -> BlockSpace {
    let space = BlockSpace::new(dir, ContainerId::new(7));
    space.create(512, 16, 0.5).expect("create");
    space.open().expect("open");
    space
}

/// Every used block except the reserved one belongs to exactly one unit, and
/// the used counter includes the reserved block.
fn assert_consistent(space: &BlockSpace) {
    let mut owned = BTreeSet::new();
    for unit in space.unit_ids().unwrap() {
        for block in space.unit_blocks(unit).unwrap() {
            assert!(owned.insert(block), "block {block} owned twice");
        }
    }
    for lba in 1..space.block_count().unwrap() {
        assert_eq!(space.is_used(lba), owned.contains(&lba), "block {lba}");
    }
    assert_eq!(space.used_blocks().unwrap() as usize, owned.len() + 1);
    assert_eq!(
        space.used_blocks().unwrap() + space.free_blocks().unwrap(),
        space.block_count().unwrap()
    );
}

#[test]
fn test_seventeenth_allocation_extends_once() {
    let dir = tempfile::tempdir().unwrap();
    let space = open_space(dir.path());
    let unit = space.create_unit(None, false).unwrap();

    let blocks: Vec<u32> = (0..17)
        .map(|_| space.allocate(None, unit, false).unwrap())
        .collect();

    assert!(!blocks.contains(&0));
    assert_eq!(blocks.iter().collect::<BTreeSet<_>>().len(), 17);
    assert_eq!(space.block_count().unwrap(), 24);
    assert_eq!(space.free_blocks().unwrap(), 24 - 18);
    assert_consistent(&space);
}

#[test]
fn test_explicit_block_beyond_end_extends() {
    let dir = tempfile::tempdir().unwrap();
    let space = open_space(dir.path());
    let unit = space.create_unit(None, false).unwrap();

    assert_eq!(space.allocate(Some(30), unit, false).unwrap(), 30);
    assert_eq!(space.block_count().unwrap(), 32);
    // the hint moved past the explicit block
    assert_eq!(space.allocate(None, unit, false).unwrap(), 31);
    assert!(space.allocate(Some(30), unit, false).is_err());
    assert!(space.allocate(Some(0), unit, false).is_err());
}

#[test]
fn test_drop_unit_releases_only_its_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let space = open_space(dir.path());
    let first = space.create_unit(None, false).unwrap();
    let second = space.create_unit(None, false).unwrap();
    assert_eq!(second, UnitId::new(2));

    for i in 0..10 {
        let unit = if i % 2 == 0 { first } else { second };
        space.allocate(None, unit, false).unwrap();
    }
    let kept = space.unit_blocks(second).unwrap();

    let released = space.drop_unit(first, false).unwrap();
    assert_eq!(released.len(), 5);
    for block in &released {
        assert!(!space.is_used(*block));
    }
    assert_eq!(space.unit_blocks(second).unwrap(), kept);
    assert!(space.allocate(None, first, false).is_err());
    assert_consistent(&space);

    // freed ids are handed out again
    assert_eq!(space.create_unit(None, false).unwrap(), first);
}

#[test]
fn test_random_allocation_keeps_bitmaps_in_sync() {
    let dir = tempfile::tempdir().unwrap();
    let space = open_space(dir.path());
    let mut rng = StdRng::seed_from_u64(42);
    let units: Vec<UnitId> = (0..3)
        .map(|_| space.create_unit(None, false).unwrap())
        .collect();
    let mut live: Vec<(u32, UnitId)> = Vec::new();

    for _ in 0..400 {
        let size_before = space.block_count().unwrap();
        if live.is_empty() || rng.gen::<f64>() < 0.6 {
            let unit = units[rng.gen_range(0..units.len())];
            let lba = space.allocate(None, unit, false).unwrap();
            assert!(live.iter().all(|(block, _)| *block != lba), "block {lba} handed out twice");
            live.push((lba, unit));
        } else {
            let (lba, unit) = live.swap_remove(rng.gen_range(0..live.len()));
            space.release(lba, unit, false).unwrap();
        }
        assert!(space.block_count().unwrap() >= size_before);
    }
    assert_consistent(&space);

    space.close().unwrap();
    let reopened = BlockSpace::new(dir.path(), ContainerId::new(7));
    reopened.open().unwrap();
    assert!(reopened.repair_report().is_none());
    for (lba, unit) in &live {
        assert_eq!(reopened.owner_of(*lba), Some(*unit));
    }
    assert_consistent(&reopened);
}
