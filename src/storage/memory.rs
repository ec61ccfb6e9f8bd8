//! In-memory backend for tests and ephemeral locations.

use super::{
    BackendError, BackendFactory, BackendResult, BoxReader, ChecksumAlgorithm, StorageBackend,
    WriteSink,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::{io::Cursor, sync::Arc};
use uuid::Uuid;

/// Shared byte map, keyed by URI. Clones share the same contents.
#[derive(Clone, Default)]
pub struct MemoryStore {
    objects: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uri: &str) -> Option<Vec<u8>> {
        self.objects.get(uri).map(|entry| entry.value().clone())
    }

    /// Overwrite bytes directly, bypassing any sink.
    pub fn insert(&self, uri: impl Into<String>, data: Vec<u8>) {
        self.objects.insert(uri.into(), data);
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.objects.contains_key(uri)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

pub struct MemoryBackend {
    uri: String,
    store: MemoryStore,
    algorithm: ChecksumAlgorithm,
}

impl MemoryBackend {
    pub fn new(uri: impl Into<String>, store: MemoryStore, algorithm: ChecksumAlgorithm) -> Self {
        Self {
            uri: uri.into(),
            store,
            algorithm,
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    async fn open(&self) -> BackendResult<BoxReader> {
        let data = self
            .store
            .get(&self.uri)
            .ok_or_else(|| BackendError::NotFound(self.uri.clone()))?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn initialize(&self, size: u64) -> BackendResult<Option<String>> {
        let mut entry = self.store.objects.entry(self.uri.clone()).or_default();
        entry.resize(size as usize, 0);
        Ok(None)
    }

    async fn get_save_stream(&self) -> BackendResult<Box<dyn WriteSink>> {
        Ok(Box::new(MemorySink {
            uri: self.uri.clone(),
            store: self.store.clone(),
            offset: None,
            buffer: Vec::new(),
        }))
    }

    async fn update_stream(&self, offset: u64) -> BackendResult<Box<dyn WriteSink>> {
        if !self.store.contains(&self.uri) {
            return Err(BackendError::NotFound(self.uri.clone()));
        }
        Ok(Box::new(MemorySink {
            uri: self.uri.clone(),
            store: self.store.clone(),
            offset: Some(offset as usize),
            buffer: Vec::new(),
        }))
    }

    async fn delete(&self) -> BackendResult<()> {
        self.store.objects.remove(&self.uri);
        Ok(())
    }
}

/// Buffers writes; nothing reaches the store before commit.
struct MemorySink {
    uri: String,
    store: MemoryStore,
    offset: Option<usize>,
    buffer: Vec<u8>,
}

#[async_trait]
impl WriteSink for MemorySink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> BackendResult<()> {
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> BackendResult<()> {
        let sink = *self;
        match sink.offset {
            None => sink.store.insert(sink.uri, sink.buffer),
            Some(offset) => {
                let mut entry = sink.store.objects.entry(sink.uri).or_default();
                let end = offset + sink.buffer.len();
                if entry.len() < end {
                    entry.resize(end, 0);
                }
                entry[offset..end].copy_from_slice(&sink.buffer);
            }
        }
        Ok(())
    }
}

pub struct MemoryFactory {
    store: MemoryStore,
}

impl MemoryFactory {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }
}

impl BackendFactory for MemoryFactory {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn file_uri(&self, location_uri: &str, file_id: Uuid) -> String {
        format!("{}/{}", location_uri.trim_end_matches('/'), file_id.simple())
    }

    fn build(
        &self,
        uri: &str,
        algorithm: ChecksumAlgorithm,
    ) -> BackendResult<Box<dyn StorageBackend>> {
        Ok(Box::new(MemoryBackend::new(
            uri,
            self.store.clone(),
            algorithm,
        )))
    }
}
