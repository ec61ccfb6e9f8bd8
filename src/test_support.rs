//! Shared fixtures for unit tests: a temp directory holding a file-backed
//! SQLite database and the default location.

use crate::{
    db,
    models::{bucket::Bucket, file_instance::FileInstance, location::Location},
    services::{
        FilesStore,
        multipart::MultipartSettings,
        objects::CreateBucket,
    },
    storage::{BackendRegistry, BoxReader, ChecksumAlgorithm, memory::MemoryStore},
};
use std::{path::Path, sync::Arc};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

pub(crate) struct TestStore {
    pub dir: TempDir,
    pub store: FilesStore,
    pub location: Location,
    pub memory: MemoryStore,
}

impl TestStore {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("meta.db").display());
        let pool = db::connect(&url, 4).await.unwrap();
        db::run_migrations(&pool).await.unwrap();

        let memory = MemoryStore::new();
        let backends = BackendRegistry::with_defaults(ChecksumAlgorithm::Sha256, memory.clone());
        let settings = MultipartSettings {
            min_chunk_size: 1,
            max_chunk_size: 1 << 30,
            max_parts: 10_000,
        };
        let store = FilesStore::new(Arc::new(pool), Arc::new(backends), settings, dir.path());

        let data_dir = dir.path().join("data");
        let location = store
            .objects
            .create_location("default", &data_dir.to_string_lossy(), true)
            .await
            .unwrap();

        Self {
            dir,
            store,
            location,
            memory,
        }
    }

    pub async fn bucket(&self) -> Bucket {
        self.store
            .objects
            .create_bucket(CreateBucket::default())
            .await
            .unwrap()
    }

    pub fn digest(&self, data: &[u8]) -> String {
        self.store.backends.algorithm().digest(data)
    }

    /// Number of committed `data` files under the default location.
    pub fn physical_file_count(&self) -> usize {
        fn walk(path: &Path) -> usize {
            let Ok(entries) = std::fs::read_dir(path) else {
                return 0;
            };
            entries
                .flatten()
                .map(|entry| {
                    let path = entry.path();
                    if path.is_dir() {
                        walk(&path)
                    } else {
                        usize::from(path.file_name().is_some_and(|name| name == "data"))
                    }
                })
                .sum()
        }
        walk(Path::new(&self.location.uri))
    }

    /// Replace the bytes of an fs-backed file behind the registry's back.
    pub fn overwrite_physical(&self, file: &FileInstance, data: &[u8]) {
        std::fs::write(&file.uri, data).unwrap();
    }
}

pub(crate) async fn read_to_vec(mut reader: BoxReader) -> Vec<u8> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.unwrap();
    buf
}
