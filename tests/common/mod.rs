//! Fixture shared by the integration suites: a temp directory holding the
//! SQLite database and a filesystem-backed default location.

#![allow(dead_code)]

use files_store::{
    db,
    models::{bucket::Bucket, location::Location},
    services::{FilesStore, multipart::MultipartSettings, objects::CreateBucket},
    storage::{BackendRegistry, BoxReader, ChecksumAlgorithm, bytes_stream, memory::MemoryStore},
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

pub struct Harness {
    pub dir: TempDir,
    pub store: FilesStore,
    pub location: Location,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("files.db").display());
        let pool = db::connect(&url, 4).await.unwrap();
        db::run_migrations(&pool).await.unwrap();

        let backends = BackendRegistry::with_defaults(ChecksumAlgorithm::Sha256, MemoryStore::new());
        let settings = MultipartSettings {
            min_chunk_size: 1,
            ..MultipartSettings::default()
        };
        let store = FilesStore::new(Arc::new(pool), Arc::new(backends), settings, dir.path());
        let root = dir.path().join("data");
        let location = store
            .objects
            .create_location("primary", &root.to_string_lossy(), true)
            .await
            .unwrap();

        Self {
            dir,
            store,
            location,
        }
    }

    pub async fn bucket(&self) -> Bucket {
        self.store
            .objects
            .create_bucket(CreateBucket::default())
            .await
            .unwrap()
    }

    pub async fn put(&self, bucket: &Bucket, key: &str, data: &'static [u8]) -> uuid::Uuid {
        self.store
            .objects
            .put_object(bucket.id, key, bytes_stream(data), Some(data.len() as u64))
            .await
            .unwrap()
            .version_id
    }

    /// Bytes of the HEAD, or of `version` when given.
    pub async fn read(&self, bucket: &Bucket, key: &str, version: Option<uuid::Uuid>) -> Vec<u8> {
        let version = self
            .store
            .objects
            .get_object(bucket.id, key, version)
            .await
            .unwrap();
        let opened = self.store.objects.open_object(version, None).await.unwrap();
        read_all(opened.reader).await
    }

    pub async fn head_count(&self, bucket: &Bucket, key: &str) -> usize {
        self.store
            .objects
            .list_versions(bucket.id, Some(key))
            .await
            .unwrap()
            .iter()
            .filter(|v| v.is_head)
            .count()
    }
}

pub async fn read_all(mut reader: BoxReader) -> Vec<u8> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.unwrap();
    buf
}
