//! Bracket index benchmarks.
//!
//! Benchmarks for:
//! - Sequential and random inserts
//! - Point lookups
//! - Subtree scans

use std::sync::Arc;

use bracket_common::config::StorageConfig;
use bracket_common::types::{ContainerId, DeweyId, PageId};
use bracket_storage::{BlockSpace, BracketIndex, BufferManager, ContainerRegistry, TxManager};
use bracket_wal::LogManager;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

const CONTAINER: ContainerId = ContainerId::new(1);

/// A fresh store with 4 KiB pages and an in-memory log.
fn setup() -> (TempDir, TxManager) {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig::for_testing(dir.path())
        .with_block_size(4096)
        .with_initial_blocks(256)
        .with_buffer_frames(1024);
    let space = Arc::new(BlockSpace::new(dir.path(), CONTAINER));
    space.create_with(&config).unwrap();
    space.open().unwrap();
    let registry = Arc::new(ContainerRegistry::new());
    registry.register(space).unwrap();
    let buffer = Arc::new(BufferManager::with_config(
        registry,
        Arc::new(LogManager::in_memory()),
        &config,
    ));
    let index = BracketIndex::new(Arc::clone(&buffer), &config);
    (dir, TxManager::new(buffer, index))
}

/// Keys of a document with `count` nodes, three children per element.
fn document_keys(count: usize) -> Vec<DeweyId> {
    let mut keys = vec![DeweyId::document(1)];
    let mut next = 0;
    while keys.len() < count {
        let parent = keys[next].clone();
        for i in 1..=3 {
            if keys.len() < count {
                keys.push(parent.child(i));
            }
        }
        next += 1;
    }
    keys.sort();
    keys
}

fn generate_values(count: usize, size: usize) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..count)
        .map(|_| (0..size).map(|_| rng.gen()).collect())
        .collect()
}

fn load(manager: &TxManager, keys: &[DeweyId], values: &[Vec<u8>]) -> PageId {
    let tx = manager.begin();
    let index = manager.index();
    let root = index.create_index(&tx, CONTAINER, None).unwrap();
    for (key, value) in keys.iter().zip(values) {
        index.insert(&tx, root, key, value.clone()).unwrap();
    }
    manager.commit(&tx).unwrap();
    root
}

/// Benchmark inserts in document order.
fn bench_insert_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("bracket/insert_sequential");

    for size in [1000, 10_000].iter() {
        let keys = document_keys(*size);
        let values = generate_values(*size, 64);

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let (_dir, manager) = setup();
                black_box(load(&manager, &keys, &values))
            });
        });
    }

    group.finish();
}

/// Benchmark inserts in random key order.
fn bench_insert_random(c: &mut Criterion) {
    let mut group = c.benchmark_group("bracket/insert_random");

    for size in [1000, 10_000].iter() {
        let mut keys = document_keys(*size);
        keys.shuffle(&mut StdRng::seed_from_u64(7));
        let values = generate_values(*size, 64);

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let (_dir, manager) = setup();
                black_box(load(&manager, &keys, &values))
            });
        });
    }

    group.finish();
}

/// Benchmark point lookups.
fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("bracket/get");
    let size = 10_000;
    let keys = document_keys(size);
    let values = generate_values(size, 64);
    let (_dir, manager) = setup();
    let root = load(&manager, &keys, &values);
    let mut rng = StdRng::seed_from_u64(42);

    group.throughput(Throughput::Elements(1));
    group.bench_function("random", |b| {
        b.iter(|| {
            let key = &keys[rng.gen_range(0..keys.len())];
            black_box(manager.index().get(root, key).unwrap())
        });
    });

    group.finish();
}

/// Benchmark subtree scans of different sizes.
fn bench_subtree_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("bracket/subtree_scan");
    let size = 10_000;
    let keys = document_keys(size);
    let values = generate_values(size, 64);
    let (_dir, manager) = setup();
    let root = load(&manager, &keys, &values);

    for subtree in ["1.1.1.1", "1.1.1", "1.1", "1"].iter() {
        let key: DeweyId = subtree.parse().unwrap();
        let count = manager.index().subtree(root, &key, true).count();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(subtree), &key, |b, key| {
            b.iter(|| {
                let scanned = manager
                    .index()
                    .subtree(root, key, true)
                    .filter_map(Result::ok)
                    .count();
                black_box(scanned)
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_insert_sequential,
    bench_insert_random,
    bench_get,
    bench_subtree_scan,
);

criterion_main!(benches);
