//! Registry of open containers.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use bracket_common::types::ContainerId;

use super::block_space::BlockSpace;
use super::error::{StoreError, StoreResult};

/// Maps container ids to their open block spaces.
///
/// Owned by whoever owns the storage context; there is no process-wide
/// instance.
#[derive(Default)]
pub struct ContainerRegistry {
    spaces: RwLock<BTreeMap<ContainerId, Arc<BlockSpace>>>,
}

impl ContainerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an open space.
    pub fn register(&self, space: Arc<BlockSpace>) -> StoreResult<()> {
        let id = space.id();
        let mut spaces = self.spaces.write();
        if spaces.contains_key(&id) {
            return Err(StoreError::ContainerExists { id });
        }
        debug!(container = %id, "registered container");
        spaces.insert(id, space);
        Ok(())
    }

    /// Removes a space from the registry and returns it.
    pub fn deregister(&self, id: ContainerId) -> StoreResult<Arc<BlockSpace>> {
        let space = self
            .spaces
            .write()
            .remove(&id)
            .ok_or(StoreError::ContainerNotFound { id })?;
        debug!(container = %id, "deregistered container");
        Ok(space)
    }

    /// Looks up a space.
    pub fn get(&self, id: ContainerId) -> StoreResult<Arc<BlockSpace>> {
        self.spaces
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ContainerNotFound { id })
    }

    /// Ids of all registered containers.
    pub fn ids(&self) -> Vec<ContainerId> {
        self.spaces.read().keys().copied().collect()
    }

    /// Closes and deregisters every space. Stops at the first failure.
    pub fn close_all(&self) -> StoreResult<()> {
        let spaces = std::mem::take(&mut *self.spaces.write());
        for space in spaces.into_values() {
            if !space.is_closed() {
                space.close()?;
            }
        }
        Ok(())
    }

    /// One diagnostics line per container.
    pub fn info(&self) -> Vec<String> {
        self.spaces.read().values().map(|s| s.info()).collect()
    }
}

impl std::fmt::Debug for ContainerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRegistry")
            .field("containers", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_lookup_deregister() {
        let dir = tempfile::tempdir().unwrap();
        let space = Arc::new(BlockSpace::new(dir.path(), ContainerId::new(3)));
        space.create(512, 8, 0.5).unwrap();
        space.open().unwrap();

        let registry = ContainerRegistry::new();
        registry.register(Arc::clone(&space)).unwrap();
        assert!(matches!(
            registry.register(Arc::clone(&space)),
            Err(StoreError::ContainerExists { .. })
        ));
        assert_eq!(registry.get(ContainerId::new(3)).unwrap().id(), space.id());
        assert!(registry.get(ContainerId::new(4)).is_err());

        let info = registry.info();
        assert_eq!(info.len(), 1);
        assert!(info[0].starts_with("#3 "));

        registry.deregister(ContainerId::new(3)).unwrap();
        assert!(registry.ids().is_empty());
        assert!(registry.deregister(ContainerId::new(3)).is_err());
    }

    #[test]
    fn test_close_all() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ContainerRegistry::new();
        for id in 1..=2 {
            let space = Arc::new(BlockSpace::new(dir.path(), ContainerId::new(id)));
            space.create(512, 8, 0.5).unwrap();
            space.open().unwrap();
            registry.register(space).unwrap();
        }
        let first = registry.get(ContainerId::new(1)).unwrap();

        registry.close_all().unwrap();
        assert!(first.is_closed());
        assert!(registry.ids().is_empty());
    }
}
