//! Name-keyed backend registry, resolved once at startup.

use super::{
    BackendError, BackendResult, ChecksumAlgorithm, StorageBackend,
    fs::FsFactory,
    memory::{MemoryFactory, MemoryStore},
};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Capability set a physical medium registers under its name.
pub trait BackendFactory: Send + Sync {
    fn name(&self) -> &'static str;

    /// URI for a new file instance stored under `location_uri`.
    fn file_uri(&self, location_uri: &str, file_id: Uuid) -> String;

    /// Backend bound to `uri`.
    fn build(&self, uri: &str, algorithm: ChecksumAlgorithm)
    -> BackendResult<Box<dyn StorageBackend>>;
}

pub struct BackendRegistry {
    factories: BTreeMap<&'static str, Arc<dyn BackendFactory>>,
    algorithm: ChecksumAlgorithm,
}

impl BackendRegistry {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        Self {
            factories: BTreeMap::new(),
            algorithm,
        }
    }

    /// Registry with the filesystem backend and an in-memory backend backed
    /// by `memory`.
    pub fn with_defaults(algorithm: ChecksumAlgorithm, memory: MemoryStore) -> Self {
        Self::new(algorithm)
            .register(FsFactory)
            .register(MemoryFactory::new(memory))
    }

    pub fn register(mut self, factory: impl BackendFactory + 'static) -> Self {
        self.factories.insert(factory.name(), Arc::new(factory));
        self
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    fn factory(&self, name: &str) -> BackendResult<&Arc<dyn BackendFactory>> {
        self.factories
            .get(name)
            .ok_or_else(|| BackendError::UnknownBackend(name.to_string()))
    }

    pub fn allocate_uri(&self, name: &str, location_uri: &str, file_id: Uuid) -> BackendResult<String> {
        Ok(self.factory(name)?.file_uri(location_uri, file_id))
    }

    pub fn backend(&self, name: &str, uri: &str) -> BackendResult<Box<dyn StorageBackend>> {
        self.factory(name)?.build(uri, self.algorithm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_registered_backends_by_name() {
        let registry = BackendRegistry::with_defaults(ChecksumAlgorithm::Sha256, MemoryStore::new());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["fs", "memory"]);

        let id = Uuid::new_v4();
        let uri = registry.allocate_uri("memory", "mem://loc", id).unwrap();
        assert_eq!(uri, format!("mem://loc/{}", id.simple()));
        assert_eq!(registry.backend("memory", &uri).unwrap().uri(), uri);

        assert!(matches!(
            registry.backend("s3", "s3://bucket/key"),
            Err(BackendError::UnknownBackend(_))
        ));
    }
}
