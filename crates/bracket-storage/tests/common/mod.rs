//! Shared setup for the storage integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use bracket_common::config::StorageConfig;
use bracket_common::types::{ContainerId, DeweyId};
use bracket_storage::{BlockSpace, BracketIndex, BufferManager, ContainerRegistry, TxManager};
use bracket_wal::{LogConfig, LogManager};

/// Container every test store uses.
pub const CONTAINER: ContainerId = ContainerId::new(1);

/// One container, a log, a buffer and a transaction manager wired together.
pub struct Store {
    pub space: Arc<BlockSpace>,
    pub log: Arc<LogManager>,
    pub buffer: Arc<BufferManager>,
    pub manager: TxManager,
}

impl Store {
    /// A fresh store with an in-memory log.
    pub fn in_memory(dir: &Path) -> Self {
        let config = StorageConfig::for_testing(dir);
        let space = Arc::new(BlockSpace::new(dir, CONTAINER));
        space.create_with(&config).expect("create space");
        space.open().expect("open space");
        Self::assemble(space, Arc::new(LogManager::in_memory()), &config)
    }

    /// Creates (`create = true`) or reopens a store whose data and log
    /// files live under `dir`.
    pub fn on_disk(dir: &Path, create: bool) -> Self {
        let config = StorageConfig::for_testing(dir.join("data"));
        std::fs::create_dir_all(&config.data_dir).expect("data dir");
        let space = Arc::new(BlockSpace::new(&config.data_dir, CONTAINER));
        if create {
            space.create_with(&config).expect("create space");
        }
        space.open().expect("open space");
        let log = LogManager::open(LogConfig::for_testing(dir.join("log"))).expect("open log");
        Self::assemble(space, Arc::new(log), &config)
    }

    fn assemble(space: Arc<BlockSpace>, log: Arc<LogManager>, config: &StorageConfig) -> Self {
        let registry = Arc::new(ContainerRegistry::new());
        registry.register(Arc::clone(&space)).expect("register space");
        let buffer = Arc::new(BufferManager::with_config(registry, Arc::clone(&log), config));
        let index = BracketIndex::new(Arc::clone(&buffer), config);
        let manager = TxManager::new(Arc::clone(&buffer), index);
        Self {
            space,
            log,
            buffer,
            manager,
        }
    }

    /// The index layer.
    pub fn index(&self) -> &BracketIndex {
        self.manager.index()
    }

    /// Flushes pages and log, then closes the container cleanly.
    pub fn shutdown(self) {
        self.buffer.flush_all().expect("flush buffer");
        self.log.close().expect("close log");
        self.space.close().expect("close space");
    }
}

/// Parses a dotted key.
pub fn key(text: &str) -> DeweyId {
    text.parse().expect("valid key")
}

/// A value of `len` bytes derived from `seed`.
pub fn value(seed: u32, len: usize) -> Vec<u8> {
    (0..len).map(|i| (seed as usize + i) as u8).collect()
}
