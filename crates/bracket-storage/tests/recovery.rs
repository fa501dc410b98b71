//! Commit, rollback and restart after a crash.

mod common;

use bracket_common::types::{DeweyId, PageId};
use bracket_storage::BracketIndex;
use bracket_wal::TxState;

use common::{key, value, Store, CONTAINER};

fn snapshot(index: &BracketIndex, root: PageId) -> Vec<(DeweyId, Vec<u8>)> {
    index
        .subtree(root, &key("1"), true)
        .map(|entry| {
            let (k, v) = entry.unwrap();
            (k, v.to_vec())
        })
        .collect()
}

#[test]
fn test_rollback_restores_content() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::in_memory(dir.path());
    let index = store.index();

    let setup = store.manager.begin();
    let root = index.create_index(&setup, CONTAINER, None).unwrap();
    for i in 1..=40 {
        index.insert(&setup, root, &key("1").child(i), value(i, 24)).unwrap();
    }
    store.manager.commit(&setup).unwrap();
    let before = snapshot(index, root);

    let tx = store.manager.begin();
    for i in 41..=120 {
        index.insert(&tx, root, &key("1").child(i), value(i, 24)).unwrap();
    }
    index.update(&tx, root, &key("1.3"), value(99, 700)).unwrap();
    index.delete(&tx, root, &key("1.7")).unwrap();
    index.delete_subtree(&tx, root, &key("1.20")).unwrap();
    assert_ne!(snapshot(index, root), before);

    let undone = store.manager.rollback(&tx).unwrap();
    assert!(undone >= 80 + 3);
    assert_eq!(tx.state(), TxState::RolledBack);
    assert_eq!(snapshot(index, root), before);
    assert_eq!(index.verify(root).unwrap().records, 40);

    // a rolled back transaction is done
    assert!(store.manager.commit(&tx).is_err());
}

#[test]
fn test_rollback_releases_blob_pages() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::in_memory(dir.path());
    let index = store.index();

    let setup = store.manager.begin();
    let root = index.create_index(&setup, CONTAINER, None).unwrap();
    index.insert(&setup, root, &key("1"), "doc").unwrap();
    store.manager.commit(&setup).unwrap();
    let used = store.space.used_blocks().unwrap();

    let tx = store.manager.begin();
    index.insert(&tx, root, &key("1.1"), value(1, 1500)).unwrap();
    assert!(store.space.used_blocks().unwrap() > used);
    store.manager.rollback(&tx).unwrap();

    assert_eq!(store.space.used_blocks().unwrap(), used);
    assert_eq!(index.get(root, &key("1.1")).unwrap(), None);
}

#[test]
fn test_commit_frees_replaced_blob() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::in_memory(dir.path());
    let index = store.index();

    let tx = store.manager.begin();
    let root = index.create_index(&tx, CONTAINER, None).unwrap();
    index.insert(&tx, root, &key("1"), value(1, 1500)).unwrap();
    store.manager.commit(&tx).unwrap();
    let with_blob = store.space.used_blocks().unwrap();

    // undone replacement keeps the blob
    let tx = store.manager.begin();
    index.update(&tx, root, &key("1"), "short").unwrap();
    assert_eq!(tx.pending_count(), 1);
    store.manager.rollback(&tx).unwrap();
    assert_eq!(store.space.used_blocks().unwrap(), with_blob);
    assert_eq!(index.get(root, &key("1")).unwrap().unwrap(), value(1, 1500));

    let tx = store.manager.begin();
    index.update(&tx, root, &key("1"), "short").unwrap();
    // the chain survives until commit
    assert_eq!(store.space.used_blocks().unwrap(), with_blob);
    store.manager.commit(&tx).unwrap();
    assert_eq!(tx.state(), TxState::Committed);
    assert_eq!(tx.pending_count(), 0);

    assert!(store.space.used_blocks().unwrap() + 3 <= with_blob);
    assert_eq!(index.get(root, &key("1")).unwrap().unwrap(), "short");
}

#[test]
fn test_restart_redoes_winners_and_undoes_losers() {
    let dir = tempfile::tempdir().unwrap();
    let root;
    {
        let store = Store::on_disk(dir.path(), true);
        let index = store.index();

        let winner = store.manager.begin();
        root = index.create_index(&winner, CONTAINER, None).unwrap();
        index.insert(&winner, root, &key("1"), "doc").unwrap();
        for i in 1..=60 {
            index.insert(&winner, root, &key("1").child(i), value(i, 24)).unwrap();
        }
        index.insert(&winner, root, &key("1.61"), value(61, 900)).unwrap();
        store.manager.commit(&winner).unwrap();

        let loser = store.manager.begin();
        for i in 62..=100 {
            index.insert(&loser, root, &key("1").child(i), value(i, 24)).unwrap();
        }
        index.update(&loser, root, &key("1.1"), "changed").unwrap();
        index.delete(&loser, root, &key("1.2")).unwrap();

        // some loser changes reach the disk, then the process dies
        store.buffer.flush_all().unwrap();
        store.log.flush_all().unwrap();
    }

    let store = Store::on_disk(dir.path(), false);
    assert!(store.space.repair_report().is_some());
    let report = store.manager.restart().unwrap();
    assert_eq!(report.losers.len(), 1);
    assert!(report.undone >= 39 + 2);

    let index = store.index();
    assert_eq!(index.verify(root).unwrap().records, 62);
    assert_eq!(index.get(root, &key("1.1")).unwrap().unwrap(), value(1, 24));
    assert_eq!(index.get(root, &key("1.2")).unwrap().unwrap(), value(2, 24));
    assert_eq!(index.get(root, &key("1.61")).unwrap().unwrap(), value(61, 900));
    assert_eq!(index.get(root, &key("1.62")).unwrap(), None);

    // new transactions continue after the recovered ones
    let tx = store.manager.begin();
    assert!(tx.id() > report.losers[0]);
    index.insert(&tx, root, &key("1.62"), "after restart").unwrap();
    store.manager.commit(&tx).unwrap();
    store.shutdown();

    // a second restart over the completed log finds nothing to undo
    let store = Store::on_disk(dir.path(), false);
    assert!(store.space.repair_report().is_none());
    let report = store.manager.restart().unwrap();
    assert!(report.losers.is_empty());
    assert_eq!(report.undone, 0);
    assert_eq!(
        store.index().get(root, &key("1.62")).unwrap().unwrap(),
        "after restart"
    );
}

#[test]
fn test_restart_with_unflushed_loser() {
    let dir = tempfile::tempdir().unwrap();
    let root;
    {
        let store = Store::on_disk(dir.path(), true);
        let index = store.index();
        let winner = store.manager.begin();
        root = index.create_index(&winner, CONTAINER, None).unwrap();
        index.insert(&winner, root, &key("1"), "doc").unwrap();
        store.manager.commit(&winner).unwrap();

        let lost = store.manager.begin();
        index.insert(&lost, root, &key("1.1"), "never durable").unwrap();
        store.log.discard_unflushed();
    }

    let store = Store::on_disk(dir.path(), false);
    let report = store.manager.restart().unwrap();
    assert!(report.losers.is_empty());
    assert_eq!(store.index().get(root, &key("1")).unwrap().unwrap(), "doc");
    assert_eq!(store.index().get(root, &key("1.1")).unwrap(), None);
}
