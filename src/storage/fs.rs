//! Local filesystem backend.
//!
//! Objects live at `<location>/<id[0:2]>/<id[2:4]>/<id[4:]>/data`. Full writes
//! go to a `.tmp-<uuid>` sibling that is fsynced and renamed into place on
//! commit; in-place updates seek into the existing file.

use super::{
    BackendError, BackendFactory, BackendResult, BoxReader, ChecksumAlgorithm, StorageBackend,
    WriteSink,
};
use async_trait::async_trait;
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

/// Directory levels created beneath the location root for one file.
const SHARD_LEVELS: usize = 3;

const STAGING_PREFIX: &str = ".tmp-";

pub struct FsBackend {
    uri: String,
    path: PathBuf,
    algorithm: ChecksumAlgorithm,
}

impl FsBackend {
    pub fn new(uri: impl Into<String>, algorithm: ChecksumAlgorithm) -> BackendResult<Self> {
        let uri = uri.into();
        let path = path_from_uri(&uri)?;
        Ok(Self {
            uri,
            path,
            algorithm,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent(&self) -> BackendResult<&Path> {
        self.path
            .parent()
            .ok_or_else(|| BackendError::InvalidUri(self.uri.clone()))
    }

    fn not_found(&self, err: io::Error) -> BackendError {
        if err.kind() == ErrorKind::NotFound {
            BackendError::NotFound(self.uri.clone())
        } else {
            BackendError::Io(err)
        }
    }
}

#[async_trait]
impl StorageBackend for FsBackend {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    async fn open(&self) -> BackendResult<BoxReader> {
        let file = File::open(&self.path).await.map_err(|e| self.not_found(e))?;
        Ok(Box::pin(file))
    }

    async fn open_at(&self, offset: u64) -> BackendResult<BoxReader> {
        let mut file = File::open(&self.path).await.map_err(|e| self.not_found(e))?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Box::pin(file))
    }

    async fn initialize(&self, size: u64) -> BackendResult<Option<String>> {
        fs::create_dir_all(self.parent()?).await?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .await?;
        if let Err(err) = file.set_len(size).await {
            drop(file);
            let _ = self.delete().await;
            return Err(BackendError::Io(err));
        }
        Ok(None)
    }

    async fn get_save_stream(&self) -> BackendResult<Box<dyn WriteSink>> {
        let parent = self.parent()?;
        fs::create_dir_all(parent).await?;
        let tmp_path = parent.join(format!("{}{}", STAGING_PREFIX, Uuid::new_v4()));
        let file = File::create(&tmp_path).await?;
        Ok(Box::new(FsSaveSink {
            file,
            tmp_path,
            target: self.path.clone(),
            committed: false,
        }))
    }

    async fn update_stream(&self, offset: u64) -> BackendResult<Box<dyn WriteSink>> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| self.not_found(e))?;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Box::new(FsUpdateSink { file }))
    }

    async fn delete(&self) -> BackendResult<()> {
        match fs::remove_file(&self.path).await {
            Ok(_) => debug!("removed physical file {}", self.path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", self.path.display());
            }
            Err(err) => return Err(BackendError::Io(err)),
        }
        prune_empty_dirs(self.parent()?, SHARD_LEVELS).await;
        Ok(())
    }
}

struct FsSaveSink {
    file: File,
    tmp_path: PathBuf,
    target: PathBuf,
    committed: bool,
}

#[async_trait]
impl WriteSink for FsSaveSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> BackendResult<()> {
        self.file.write_all(chunk).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> BackendResult<()> {
        let mut sink = self;
        sink.file.flush().await?;
        sink.file.sync_all().await?;

        if let Err(err) = fs::rename(&sink.tmp_path, &sink.target).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&sink.target).await?;
                fs::rename(&sink.tmp_path, &sink.target).await?;
            } else {
                return Err(BackendError::Io(err));
            }
        }
        sink.committed = true;
        Ok(())
    }
}

impl Drop for FsSaveSink {
    fn drop(&mut self) {
        if !self.committed {
            if let Err(err) = std::fs::remove_file(&self.tmp_path) {
                if err.kind() != ErrorKind::NotFound {
                    debug!(
                        "failed to remove partial upload {}: {}",
                        self.tmp_path.display(),
                        err
                    );
                }
            }
        }
    }
}

struct FsUpdateSink {
    file: File,
}

#[async_trait]
impl WriteSink for FsUpdateSink {
    async fn write_chunk(&mut self, chunk: &[u8]) -> BackendResult<()> {
        self.file.write_all(chunk).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> BackendResult<()> {
        let mut sink = self;
        sink.file.flush().await?;
        sink.file.sync_data().await?;
        Ok(())
    }
}

/// Builds [`FsBackend`]s and lays out new files beneath a location directory.
pub struct FsFactory;

impl BackendFactory for FsFactory {
    fn name(&self) -> &'static str {
        "fs"
    }

    fn file_uri(&self, location_uri: &str, file_id: Uuid) -> String {
        let (shard_a, shard_b, rest) = file_shards(file_id);
        format!(
            "{}/{}/{}/{}/data",
            location_uri.trim_end_matches('/'),
            shard_a,
            shard_b,
            rest
        )
    }

    fn build(
        &self,
        uri: &str,
        algorithm: ChecksumAlgorithm,
    ) -> BackendResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FsBackend::new(uri, algorithm)?))
    }
}

/// Split a file id into the two shard directories and the remainder.
fn file_shards(file_id: Uuid) -> (String, String, String) {
    let hex = file_id.simple().to_string();
    (hex[0..2].to_string(), hex[2..4].to_string(), hex[4..].to_string())
}

fn path_from_uri(uri: &str) -> BackendResult<PathBuf> {
    let raw = uri.strip_prefix("file://").unwrap_or(uri);
    if raw.is_empty() || raw.contains("://") {
        return Err(BackendError::InvalidUri(uri.to_string()));
    }
    Ok(PathBuf::from(raw))
}

/// Delete staging files under a location root that were last written more
/// than `grace` ago. A process that dies between writing and committing
/// leaves them behind, and no metadata row points at them.
pub async fn sweep_staging(location_uri: &str, grace: Duration) -> BackendResult<u64> {
    let mut removed = 0;
    let mut pending = vec![path_from_uri(location_uri)?];
    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(BackendError::Io(err)),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
                continue;
            }
            if !entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                continue;
            }
            let age = entry
                .metadata()
                .await?
                .modified()?
                .elapsed()
                .unwrap_or_default();
            if age < grace {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("removed stale staging file {}", path.display());
                    removed += 1;
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(BackendError::Io(err)),
            }
        }
    }
    Ok(removed)
}

/// Remove up to `levels` empty directories, walking upwards from `start`.
///
/// Stops when:
/// - directory not empty
/// - directory not found
/// - encountered unexpected I/O errors
async fn prune_empty_dirs(start: &Path, levels: usize) {
    let mut current = start.to_path_buf();
    for _ in 0..levels {
        match fs::remove_dir(&current).await {
            Ok(_) => match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => break,
            },
            Err(err) if err.kind() == ErrorKind::NotFound => break,
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
            Err(err) => {
                debug!("failed to prune directory {}: {}", current.display(), err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{bytes_stream, save, update};
    use futures::stream;
    use tokio::io::AsyncReadExt;

    fn backend(root: &Path) -> FsBackend {
        let uri = FsFactory.file_uri(root.to_str().unwrap(), Uuid::new_v4());
        FsBackend::new(uri, ChecksumAlgorithm::Sha256).unwrap()
    }

    #[tokio::test]
    async fn sweep_removes_only_old_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let shard = dir.path().join("ab").join("cd");
        std::fs::create_dir_all(&shard).unwrap();
        std::fs::write(shard.join(".tmp-crashed"), b"partial").unwrap();
        std::fs::write(shard.join("data"), b"committed").unwrap();
        let root = dir.path().to_str().unwrap();

        let removed = sweep_staging(root, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 0);
        assert!(shard.join(".tmp-crashed").exists());

        let removed = sweep_staging(root, Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!shard.join(".tmp-crashed").exists());
        assert!(shard.join("data").exists());

        let missing = dir.path().join("never-created");
        assert_eq!(
            sweep_staging(missing.to_str().unwrap(), Duration::ZERO)
                .await
                .unwrap(),
            0
        );
    }

    #[test]
    fn file_uri_is_sharded_by_id() {
        let id = Uuid::parse_str("0123456789abcdef0123456789abcdef").unwrap();
        assert_eq!(
            FsFactory.file_uri("/data/", id),
            "/data/01/23/456789abcdef0123456789abcdef/data"
        );
    }

    #[tokio::test]
    async fn save_then_open_round_trips_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend.initialize(11).await.unwrap();

        let outcome = save(&backend, bytes_stream("hello world"), Some(11), None)
            .await
            .unwrap();
        assert_eq!(outcome.size, 11);
        assert_eq!(outcome.checksum, ChecksumAlgorithm::Sha256.digest(b"hello world"));
        assert_eq!(backend.checksum(4).await.unwrap(), outcome.checksum);

        let mut out = Vec::new();
        backend.open_at(6).await.unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"world");
    }

    #[tokio::test]
    async fn failed_save_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        let chunks = stream::iter(vec![
            Ok(bytes::Bytes::from_static(b"abc")),
            Err(io::Error::new(ErrorKind::ConnectionReset, "client went away")),
        ]);
        assert!(save(&backend, chunks, None, None).await.is_err());

        let parent = backend.path().parent().unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(parent).unwrap().collect();
        assert!(leftovers.is_empty());
        assert!(matches!(backend.open().await, Err(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn size_mismatch_is_rejected_before_commit() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        let err = save(&backend, bytes_stream("abc"), Some(5), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BackendError::SizeMismatch {
                expected: 5,
                actual: 3
            }
        ));
        assert!(!backend.path().exists());
    }

    #[tokio::test]
    async fn update_writes_at_offset_within_reserved_space() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        backend.initialize(6).await.unwrap();

        update(&backend, 3, bytes_stream("def"), Some(3)).await.unwrap();
        update(&backend, 0, bytes_stream("abc"), Some(3)).await.unwrap();

        let mut out = Vec::new();
        backend.open().await.unwrap().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcdef");
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_prunes_shards() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        save(&backend, bytes_stream("x"), None, None).await.unwrap();

        backend.delete().await.unwrap();
        backend.delete().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
