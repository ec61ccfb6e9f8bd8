//! File instance registry.
//!
//! Owns the link between file instance rows and physical bytes: staging new
//! content into a backend, recording it, verifying checksums and removing
//! unreferenced data. Bytes are always written before the row that points at
//! them is committed, and rows are always removed before their bytes.

use crate::{
    errors::{FilesError, FilesResult, ResourceKind, conflict_or_sqlx},
    models::{
        file_instance::{FILE_COLUMNS, FileInstance},
        location::Location,
    },
    services::events::{Event, EventBus},
    storage::{self, BackendRegistry, DEFAULT_CHUNK_SIZE, StorageBackend},
};
use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use serde::Serialize;
use sqlx::{Executor, Sqlite, SqliteConnection, SqlitePool};
use std::{io, sync::Arc};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bytes written to a backend but not yet recorded in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub id: Uuid,
    pub uri: String,
    pub backend: String,
    pub size: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, Copy)]
pub struct VerifyOptions {
    /// Also check files whose previous verification failed.
    pub pessimistic: bool,
    /// Propagate backend failures instead of recording an unknown result.
    pub throws: bool,
    pub chunk_size: usize,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            pessimistic: false,
            throws: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Passed,
    Failed,
    Unavailable,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileCheck {
    pub file_id: Uuid,
    pub outcome: CheckOutcome,
    pub size: u64,
}

#[derive(Clone)]
pub struct FileRegistry {
    db: Arc<SqlitePool>,
    backends: Arc<BackendRegistry>,
    events: EventBus,
}

impl FileRegistry {
    pub fn new(db: Arc<SqlitePool>, backends: Arc<BackendRegistry>, events: EventBus) -> Self {
        Self {
            db,
            backends,
            events,
        }
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    /// Backend bound to an existing file instance.
    pub fn backend_for(&self, file: &FileInstance) -> FilesResult<Box<dyn StorageBackend>> {
        Ok(self.backends.backend(&file.backend, &file.uri)?)
    }

    /// Write `stream` to a fresh object under `location`.
    ///
    /// When `size` is known it is reserved up front and enforced. On any
    /// failure the partial object is removed before returning.
    pub async fn stage<S>(
        &self,
        location: &Location,
        backend_name: &str,
        stream: S,
        size: Option<u64>,
        limit: Option<u64>,
    ) -> FilesResult<StagedFile>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        if let (Some(size), Some(limit)) = (size, limit) {
            if size > limit {
                return Err(FilesError::FileTooLarge { limit });
            }
        }

        let id = Uuid::new_v4();
        let uri = self.backends.allocate_uri(backend_name, &location.uri, id)?;
        let mut backend = self.backends.backend(backend_name, &uri)?;
        if let Some(relocated) = backend.initialize(size.unwrap_or(0)).await? {
            backend = self.backends.backend(backend_name, &relocated)?;
        }

        let outcome = match storage::save(backend.as_ref(), stream, size, limit).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Err(cleanup) = backend.delete().await {
                    warn!(file_id = %id, error = %cleanup, "failed to remove partial file");
                }
                return Err(err.into());
            }
        };

        debug!(file_id = %id, size = outcome.size, "staged file");
        Ok(StagedFile {
            id,
            uri: backend.uri().to_string(),
            backend: backend_name.to_string(),
            size: outcome.size,
            checksum: outcome.checksum,
        })
    }

    /// Remove the bytes of a staged file that never got recorded.
    pub async fn discard(&self, staged: &StagedFile) {
        let result = match self.backends.backend(&staged.backend, &staged.uri) {
            Ok(backend) => backend.delete().await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!(file_id = %staged.id, error = %err, "failed to discard staged file");
        }
    }

    /// Record a staged file as a finalized, readable instance.
    pub async fn insert_staged(
        conn: &mut SqliteConnection,
        staged: &StagedFile,
    ) -> FilesResult<FileInstance> {
        let now = Utc::now();
        sqlx::query_as::<_, FileInstance>(&format!(
            "INSERT INTO file_instances ({FILE_COLUMNS})
             VALUES (?, ?, ?, ?, ?, 1, 0, NULL, NULL, ?, ?)
             RETURNING {FILE_COLUMNS}"
        ))
        .bind(staged.id)
        .bind(&staged.uri)
        .bind(&staged.backend)
        .bind(staged.size as i64)
        .bind(&staged.checksum)
        .bind(now)
        .bind(now)
        .fetch_one(conn)
        .await
        .map_err(|err| conflict_or_sqlx(err, || format!("file {} already registered", staged.id)))
    }

    /// Record a writable placeholder whose bytes are still being assembled.
    pub(crate) async fn insert_reserved(
        conn: &mut SqliteConnection,
        id: Uuid,
        uri: &str,
        backend: &str,
        size: u64,
    ) -> FilesResult<FileInstance> {
        let now = Utc::now();
        sqlx::query_as::<_, FileInstance>(&format!(
            "INSERT INTO file_instances ({FILE_COLUMNS})
             VALUES (?, ?, ?, ?, NULL, 0, 1, NULL, NULL, ?, ?)
             RETURNING {FILE_COLUMNS}"
        ))
        .bind(id)
        .bind(uri)
        .bind(backend)
        .bind(size as i64)
        .bind(now)
        .bind(now)
        .fetch_one(conn)
        .await
        .map_err(|err| conflict_or_sqlx(err, || format!("file {} already registered", id)))
    }

    /// Stage `stream` and record it in one step.
    pub async fn create<S>(
        &self,
        location: &Location,
        backend_name: &str,
        stream: S,
        size: Option<u64>,
    ) -> FilesResult<FileInstance>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let staged = self.stage(location, backend_name, stream, size, None).await?;
        match self.record(&staged).await {
            Ok(file) => Ok(file),
            Err(err) => {
                self.discard(&staged).await;
                Err(err)
            }
        }
    }

    async fn record(&self, staged: &StagedFile) -> FilesResult<FileInstance> {
        let mut tx = self.db.begin().await?;
        let file = Self::insert_staged(&mut tx, staged).await?;
        tx.commit().await?;
        Ok(file)
    }

    pub async fn get(&self, file_id: Uuid) -> FilesResult<FileInstance> {
        fetch_file(&*self.db, file_id).await
    }

    /// A finalized readable file with identical content, if one exists.
    pub async fn find_by_checksum(
        &self,
        checksum: &str,
        size: u64,
    ) -> FilesResult<Option<FileInstance>> {
        let file = sqlx::query_as::<_, FileInstance>(&format!(
            "SELECT {FILE_COLUMNS} FROM file_instances
             WHERE checksum = ? AND size = ? AND readable = 1 AND writable = 0
             ORDER BY created_at ASC LIMIT 1"
        ))
        .bind(checksum)
        .bind(size as i64)
        .fetch_optional(&*self.db)
        .await?;
        Ok(file)
    }

    /// Recompute a file's checksum and record the outcome.
    ///
    /// A mismatch marks the file unreadable but keeps the stored checksum; a
    /// match makes a previously failed file readable again.
    pub async fn verify_checksum(
        &self,
        file_id: Uuid,
        opts: VerifyOptions,
    ) -> FilesResult<FileCheck> {
        let file = self.get(file_id).await?;
        let size = file.size_bytes();
        if file.writable {
            return Err(FilesError::InvalidOperation(format!(
                "file {} is still being written",
                file_id
            )));
        }
        if !opts.pessimistic && file.last_check == Some(false) {
            debug!(%file_id, "skipping file that already failed verification");
            return Ok(FileCheck {
                file_id,
                outcome: CheckOutcome::Skipped,
                size,
            });
        }

        let backend = self.backend_for(&file)?;
        let now = Utc::now();
        let outcome = match backend.checksum(opts.chunk_size).await {
            Ok(actual) => {
                let passed = file.checksum.as_deref() == Some(actual.as_str());
                sqlx::query(
                    "UPDATE file_instances
                     SET last_check = ?, last_check_at = ?, readable = ?, updated_at = ?
                     WHERE id = ?",
                )
                .bind(passed)
                .bind(now)
                .bind(passed)
                .bind(now)
                .bind(file_id)
                .execute(&*self.db)
                .await?;

                if passed {
                    if !file.readable {
                        info!(%file_id, "file passed verification and is readable again");
                    }
                    CheckOutcome::Passed
                } else {
                    warn!(
                        %file_id,
                        expected = ?file.checksum,
                        actual = %actual,
                        "checksum verification failed"
                    );
                    self.events.publish(Event::FileChecksumFailed {
                        file_id,
                        expected: file.checksum.clone(),
                        actual,
                    });
                    CheckOutcome::Failed
                }
            }
            Err(err) => {
                warn!(%file_id, error = %err, "checksum verification could not read file");
                sqlx::query(
                    "UPDATE file_instances
                     SET last_check = NULL, last_check_at = ?, updated_at = ?
                     WHERE id = ?",
                )
                .bind(now)
                .bind(now)
                .bind(file_id)
                .execute(&*self.db)
                .await?;
                if opts.throws {
                    return Err(err.into());
                }
                CheckOutcome::Unavailable
            }
        };

        Ok(FileCheck {
            file_id,
            outcome,
            size,
        })
    }

    /// Stream a copy of `src` to a new object under `location`.
    pub async fn copy_contents(
        &self,
        src: &FileInstance,
        location: &Location,
        backend_name: &str,
    ) -> FilesResult<StagedFile> {
        let source = self.backend_for(src)?;
        let reader = source.open().await?;
        self.stage(
            location,
            backend_name,
            ReaderStream::new(reader),
            Some(src.size_bytes()),
            None,
        )
        .await
    }

    /// Delete an unreferenced file instance, then its bytes.
    ///
    /// Returns `false` when the file is missing or still referenced by an
    /// object version or an open multipart upload.
    pub async fn remove_file_data(&self, file_id: Uuid) -> FilesResult<bool> {
        let file = match self.get(file_id).await {
            Ok(file) => file,
            Err(FilesError::NotFound { .. }) => return Ok(false),
            Err(err) => return Err(err),
        };

        let result = sqlx::query(
            "DELETE FROM file_instances
             WHERE id = ?
               AND NOT EXISTS (SELECT 1 FROM object_versions WHERE file_id = ?)
               AND NOT EXISTS (
                   SELECT 1 FROM multipart_uploads WHERE file_id = ? AND completed = 0
               )",
        )
        .bind(file_id)
        .bind(file_id)
        .bind(file_id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            debug!(%file_id, "file still referenced; keeping it");
            return Ok(false);
        }

        self.backend_for(&file)?.delete().await?;
        info!(%file_id, size = file.size, "removed file data");
        Ok(true)
    }
}

/// Fetch a file instance row through any executor.
pub(crate) async fn fetch_file<'e, E>(executor: E, file_id: Uuid) -> FilesResult<FileInstance>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, FileInstance>(&format!(
        "SELECT {FILE_COLUMNS} FROM file_instances WHERE id = ?"
    ))
    .bind(file_id)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| FilesError::not_found(ResourceKind::File, file_id))
}
