//! Multipart uploads.
//!
//! Initiating an upload reserves a writable file instance sized to the
//! declared total. Parts land in place at `part_number * chunk_size`, in any
//! order and concurrently. Completion re-reads every part before the file is
//! finalized and committed as a new HEAD.
//!
//! Part writes hold a shared per-upload lock and completion or abort holds it
//! exclusively, so no part lands in a file once it is being finalized.

use crate::{
    errors::{FilesError, FilesResult, ResourceKind, conflict_or_sqlx},
    models::{
        file_instance::{FILE_COLUMNS, FileInstance},
        multipart::{MultipartPart, MultipartUpload, PART_COLUMNS, UPLOAD_COLUMNS},
        object_version::ObjectVersion,
    },
    services::{
        events::{Event, EventBus},
        files::FileRegistry,
        objects::{commit_version, fetch_bucket, fetch_location, validate_key, writable},
    },
    storage::{self, DEFAULT_CHUNK_SIZE, hash_reader},
};
use bytes::Bytes;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use futures::Stream;
use serde::Serialize;
use sqlx::SqlitePool;
use std::{io, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct MultipartSettings {
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    pub max_parts: u64,
}

impl Default for MultipartSettings {
    fn default() -> Self {
        Self {
            min_chunk_size: 5 * 1024 * 1024,
            max_chunk_size: 5 * 1024 * 1024 * 1024,
            max_parts: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExpiryReport {
    /// Incomplete uploads reclaimed with their reserved bytes.
    pub aborted: u64,
    /// Completed upload records dropped.
    pub purged: u64,
}

#[derive(Clone)]
pub struct MultipartService {
    db: Arc<SqlitePool>,
    files: FileRegistry,
    events: EventBus,
    settings: MultipartSettings,
    locks: Arc<DashMap<Uuid, Arc<RwLock<()>>>>,
}

impl MultipartService {
    pub fn new(
        db: Arc<SqlitePool>,
        files: FileRegistry,
        events: EventBus,
        settings: MultipartSettings,
    ) -> Self {
        Self {
            db,
            files,
            events,
            settings,
            locks: Arc::new(DashMap::new()),
        }
    }

    fn upload_lock(&self, upload_id: Uuid) -> Arc<RwLock<()>> {
        self.locks.entry(upload_id).or_default().clone()
    }

    pub fn settings(&self) -> MultipartSettings {
        self.settings
    }

    /// Start an upload of `size` bytes split into `chunk_size` parts.
    pub async fn initiate(
        &self,
        bucket_id: Uuid,
        key: &str,
        size: u64,
        chunk_size: u64,
    ) -> FilesResult<MultipartUpload> {
        validate_key(key)?;
        let settings = self.settings;
        if chunk_size < settings.min_chunk_size || chunk_size > settings.max_chunk_size {
            return Err(FilesError::MultipartValidation(format!(
                "part size must be between {} and {} bytes",
                settings.min_chunk_size, settings.max_chunk_size
            )));
        }
        if size == 0 {
            return Err(FilesError::MultipartValidation(
                "declared size must be positive".into(),
            ));
        }
        let parts = size.div_ceil(chunk_size);
        if parts > settings.max_parts {
            return Err(FilesError::MultipartValidation(format!(
                "{} parts exceed the limit of {}",
                parts, settings.max_parts
            )));
        }

        let bucket = writable(fetch_bucket(&*self.db, bucket_id).await?)?;
        if let Some(limit) = bucket.max_file_size {
            if size > limit as u64 {
                return Err(FilesError::FileTooLarge {
                    limit: limit as u64,
                });
            }
        }
        if let Some(quota) = bucket.quota_size {
            let projected = bucket.size.max(0) as u64 + size;
            if projected > quota as u64 {
                return Err(FilesError::QuotaExceeded {
                    bucket_id,
                    quota: quota as u64,
                    size: projected,
                });
            }
        }

        let location = fetch_location(&*self.db, bucket.location_id).await?;

        let backends = self.files.backends();
        let file_id = Uuid::new_v4();
        let mut uri = backends.allocate_uri(&bucket.storage_class, &location.uri, file_id)?;
        let mut backend = backends.backend(&bucket.storage_class, &uri)?;
        if let Some(relocated) = backend.initialize(size).await? {
            backend = backends.backend(&bucket.storage_class, &relocated)?;
            uri = relocated;
        }

        let result = async {
            let mut tx = self.db.begin().await?;
            FileRegistry::insert_reserved(&mut tx, file_id, &uri, &bucket.storage_class, size)
                .await?;
            let now = Utc::now();
            let upload = sqlx::query_as::<_, MultipartUpload>(&format!(
                "INSERT INTO multipart_uploads ({UPLOAD_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)
                 RETURNING {UPLOAD_COLUMNS}"
            ))
            .bind(Uuid::new_v4())
            .bind(bucket_id)
            .bind(key)
            .bind(file_id)
            .bind(size as i64)
            .bind(chunk_size as i64)
            .bind(now)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok::<_, FilesError>(upload)
        }
        .await;

        match result {
            Ok(upload) => {
                info!(
                    upload_id = %upload.upload_id,
                    %bucket_id,
                    key,
                    size,
                    chunk_size,
                    "multipart upload initiated"
                );
                Ok(upload)
            }
            Err(err) => {
                if let Err(cleanup) = backend.delete().await {
                    warn!(%file_id, error = %cleanup, "failed to release reserved file");
                }
                Err(err)
            }
        }
    }

    pub async fn get_upload(&self, upload_id: Uuid) -> FilesResult<MultipartUpload> {
        sqlx::query_as::<_, MultipartUpload>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM multipart_uploads WHERE upload_id = ?"
        ))
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| FilesError::not_found(ResourceKind::Upload, upload_id))
    }

    /// Incomplete uploads of a bucket, oldest first.
    pub async fn list_uploads(&self, bucket_id: Uuid) -> FilesResult<Vec<MultipartUpload>> {
        let uploads = sqlx::query_as::<_, MultipartUpload>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM multipart_uploads
             WHERE bucket_id = ? AND completed = 0 ORDER BY created_at ASC"
        ))
        .bind(bucket_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(uploads)
    }

    pub async fn list_parts(&self, upload_id: Uuid) -> FilesResult<Vec<MultipartPart>> {
        self.get_upload(upload_id).await?;
        let parts = sqlx::query_as::<_, MultipartPart>(&format!(
            "SELECT {PART_COLUMNS} FROM multipart_parts
             WHERE upload_id = ? ORDER BY part_number ASC"
        ))
        .bind(upload_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(parts)
    }

    async fn open_upload(&self, upload_id: Uuid) -> FilesResult<(MultipartUpload, FileInstance)> {
        let upload = self.get_upload(upload_id).await?;
        if upload.completed {
            return Err(FilesError::InvalidOperation(format!(
                "multipart upload {} is already completed",
                upload_id
            )));
        }
        let file = self.files.get(upload.file_id).await?;
        Ok((upload, file))
    }

    /// Write part `part_number` in place. Re-uploading a part replaces it.
    pub async fn upload_part<S>(
        &self,
        upload_id: Uuid,
        part_number: u64,
        stream: S,
    ) -> FilesResult<MultipartPart>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let lock = self.upload_lock(upload_id);
        let _guard = lock.read().await;
        let (upload, file) = self.open_upload(upload_id).await?;
        writable(fetch_bucket(&*self.db, upload.bucket_id).await?)?;
        let (offset, size) = upload.part_layout(part_number).ok_or_else(|| {
            FilesError::MultipartValidation(format!(
                "part {} is outside 0..={}",
                part_number,
                upload.last_part_number()
            ))
        })?;

        let backend = self.files.backend_for(&file)?;
        let outcome = storage::update(backend.as_ref(), offset, stream, Some(size)).await?;

        let part = sqlx::query_as::<_, MultipartPart>(&format!(
            "INSERT INTO multipart_parts ({PART_COLUMNS})
             SELECT ?, ?, ?, ?, ?, ?
             WHERE EXISTS (
                 SELECT 1 FROM multipart_uploads WHERE upload_id = ? AND completed = 0
             )
             ON CONFLICT(upload_id, part_number) DO UPDATE SET
                 byte_offset = excluded.byte_offset,
                 size = excluded.size,
                 checksum = excluded.checksum,
                 created_at = excluded.created_at
             RETURNING {PART_COLUMNS}"
        ))
        .bind(upload_id)
        .bind(part_number as i64)
        .bind(offset as i64)
        .bind(outcome.size as i64)
        .bind(&outcome.checksum)
        .bind(Utc::now())
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await
        .map_err(|err| conflict_or_sqlx(err, || format!("part {} raced", part_number)))?
        .ok_or_else(|| {
            FilesError::IntegrityConflict(format!(
                "upload {} was finalized while part {} was written",
                upload_id, part_number
            ))
        })?;

        debug!(%upload_id, part_number, offset, size, "stored part");
        Ok(part)
    }

    /// Check the uploaded parts against the layout and the bytes on disk.
    /// Returns the checksum of the assembled file.
    async fn validate_parts(
        &self,
        upload: &MultipartUpload,
        file: &FileInstance,
        parts: &[MultipartPart],
    ) -> FilesResult<String> {
        let invalid = |msg: String| FilesError::MultipartValidation(msg);

        if parts.len() as u64 != upload.part_count() {
            return Err(invalid(format!(
                "{} of {} parts uploaded",
                parts.len(),
                upload.part_count()
            )));
        }
        let mut total: u64 = 0;
        for (index, part) in parts.iter().enumerate() {
            let expected = upload.part_layout(index as u64);
            let actual = Some((part.byte_offset as u64, part.size as u64));
            if part.part_number != index as i64 || actual != expected {
                return Err(invalid(format!(
                    "part {} does not match the upload layout",
                    part.part_number
                )));
            }
            total += part.size as u64;
        }
        if total != upload.size as u64 {
            return Err(invalid(format!(
                "parts hold {} bytes, expected {}",
                total, upload.size
            )));
        }

        let backend = self.files.backend_for(file)?;
        let algorithm = backend.algorithm();
        for part in parts {
            let mut reader = backend.open_at(part.byte_offset as u64).await?;
            let (read, checksum) = hash_reader(
                &mut reader,
                algorithm,
                DEFAULT_CHUNK_SIZE,
                Some(part.size as u64),
            )
            .await
            .map_err(storage::BackendError::from)?;
            if read != part.size as u64 || checksum != part.checksum {
                return Err(invalid(format!(
                    "part {} bytes on disk do not match its checksum",
                    part.part_number
                )));
            }
        }

        let mut reader = backend.open().await?;
        let (read, checksum) = hash_reader(&mut reader, algorithm, DEFAULT_CHUNK_SIZE, None)
            .await
            .map_err(storage::BackendError::from)?;
        if read != upload.size as u64 {
            return Err(invalid(format!(
                "assembled file holds {} bytes, expected {}",
                read, upload.size
            )));
        }
        Ok(checksum)
    }

    /// Merge the parts into a finalized file and commit it as the HEAD of the
    /// upload's key. Staging is left untouched when validation fails.
    pub async fn complete(&self, upload_id: Uuid) -> FilesResult<ObjectVersion> {
        let lock = self.upload_lock(upload_id);
        let _guard = lock.write().await;
        let (upload, file) = self.open_upload(upload_id).await?;
        let parts = self.list_parts(upload_id).await?;
        let checksum = match self.validate_parts(&upload, &file, &parts).await {
            Ok(checksum) => checksum,
            Err(err) => {
                warn!(%upload_id, error = %err, "multipart upload failed validation");
                return Err(err);
            }
        };

        let mut tx = self.db.begin().await?;
        let current = sqlx::query_as::<_, MultipartPart>(&format!(
            "SELECT {PART_COLUMNS} FROM multipart_parts
             WHERE upload_id = ? ORDER BY part_number ASC"
        ))
        .bind(upload_id)
        .fetch_all(&mut *tx)
        .await?;
        if current != parts {
            return Err(FilesError::IntegrityConflict(format!(
                "parts of upload {} changed during validation",
                upload_id
            )));
        }

        let now = Utc::now();
        let file = sqlx::query_as::<_, FileInstance>(&format!(
            "UPDATE file_instances
             SET checksum = ?, readable = 1, writable = 0, updated_at = ?
             WHERE id = ? AND writable = 1
             RETURNING {FILE_COLUMNS}"
        ))
        .bind(&checksum)
        .bind(now)
        .bind(upload.file_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|err| conflict_or_sqlx(err, || format!("upload {} raced", upload_id)))?
        .ok_or_else(|| {
            FilesError::IntegrityConflict(format!("upload {} was completed concurrently", upload_id))
        })?;

        let version = commit_version(&mut tx, upload.bucket_id, &upload.key, Some(&file)).await?;

        sqlx::query(
            "UPDATE multipart_uploads SET completed = 1, updated_at = ?
             WHERE upload_id = ? AND completed = 0",
        )
        .bind(now)
        .bind(upload_id)
        .execute(&mut *tx)
        .await
        .map_err(|err| conflict_or_sqlx(err, || format!("upload {} raced", upload_id)))?;
        sqlx::query("DELETE FROM multipart_parts WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&mut *tx)
            .await?;
        tx.commit()
            .await
            .map_err(|err| conflict_or_sqlx(err, || format!("upload {} raced", upload_id)))?;
        self.locks.remove(&upload_id);

        info!(
            %upload_id,
            bucket_id = %upload.bucket_id,
            key = %upload.key,
            size = upload.size,
            "multipart upload completed"
        );
        self.events.publish(Event::ObjectUploaded {
            bucket_id: upload.bucket_id,
            key: upload.key.clone(),
            version_id: version.version_id,
            file_id: file.id,
        });
        Ok(version)
    }

    /// Drop an incomplete upload with its parts and reserved bytes.
    pub async fn abort(&self, upload_id: Uuid) -> FilesResult<()> {
        let lock = self.upload_lock(upload_id);
        let _guard = lock.write().await;
        let (upload, file) = self.open_upload(upload_id).await?;
        self.reclaim(&upload, &file).await?;
        self.locks.remove(&upload_id);
        info!(%upload_id, "multipart upload aborted");
        Ok(())
    }

    async fn reclaim(&self, upload: &MultipartUpload, file: &FileInstance) -> FilesResult<()> {
        let mut tx = self.db.begin().await?;
        let removed = sqlx::query(
            "DELETE FROM multipart_uploads WHERE upload_id = ? AND completed = 0",
        )
        .bind(upload.upload_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if removed == 0 {
            return Err(FilesError::InvalidOperation(format!(
                "multipart upload {} is already completed",
                upload.upload_id
            )));
        }
        sqlx::query("DELETE FROM file_instances WHERE id = ? AND writable = 1")
            .bind(file.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.files.backend_for(file)?.delete().await?;
        Ok(())
    }

    /// Reclaim uploads created more than `ttl` ago. Incomplete ones lose
    /// their reserved bytes; completed ones only lose the record.
    pub async fn remove_expired(&self, ttl: Duration) -> FilesResult<ExpiryReport> {
        let cutoff = Utc::now() - ttl;
        let expired = sqlx::query_as::<_, MultipartUpload>(&format!(
            "SELECT {UPLOAD_COLUMNS} FROM multipart_uploads
             WHERE completed = 0 AND created_at < ? ORDER BY created_at ASC"
        ))
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await?;

        let mut report = ExpiryReport::default();
        for upload in expired {
            let lock = self.upload_lock(upload.upload_id);
            let guard = lock.write().await;
            let result = match self.files.get(upload.file_id).await {
                Ok(file) => self.reclaim(&upload, &file).await,
                Err(err) => Err(err),
            };
            drop(guard);
            self.locks.remove(&upload.upload_id);
            match result {
                Ok(()) => report.aborted += 1,
                Err(err) => {
                    warn!(upload_id = %upload.upload_id, error = %err, "could not expire upload");
                }
            }
        }

        report.purged = sqlx::query(
            "DELETE FROM multipart_uploads WHERE completed = 1 AND updated_at < ?",
        )
        .bind(cutoff)
        .execute(&*self.db)
        .await?
        .rows_affected();

        if report.aborted > 0 || report.purged > 0 {
            info!(aborted = report.aborted, purged = report.purged, "expired multipart uploads");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::AppError,
        services::objects::CreateBucket,
        storage::bytes_stream,
        test_support::{TestStore, read_to_vec},
    };
    use axum::http::StatusCode;
    use futures::stream;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn two_parts_merge_into_one_file() {
        let ts = TestStore::new().await;
        let bucket = ts.bucket().await;
        let multipart = &ts.store.multipart;
        let mut events = ts.store.events.subscribe();

        let upload = multipart.initiate(bucket.id, "big.bin", 10, 5).await.unwrap();
        // Out of order on purpose.
        multipart
            .upload_part(upload.upload_id, 1, bytes_stream("world"))
            .await
            .unwrap();
        multipart
            .upload_part(upload.upload_id, 0, bytes_stream("hello"))
            .await
            .unwrap();

        let version = multipart.complete(upload.upload_id).await.unwrap();
        let file = ts.store.files.get(version.file_id.unwrap()).await.unwrap();
        assert_eq!(file.size, 10);
        assert_eq!(file.checksum.as_deref(), Some(ts.digest(b"helloworld").as_str()));
        assert!(file.readable && !file.writable);

        let opened = ts.store.objects.open_object(version.clone(), None).await.unwrap();
        assert_eq!(read_to_vec(opened.reader).await, b"helloworld");

        let upload = multipart.get_upload(upload.upload_id).await.unwrap();
        assert!(upload.completed);
        assert!(multipart.list_parts(upload.upload_id).await.unwrap().is_empty());
        assert!(matches!(
            events.try_recv(),
            Ok(Event::ObjectUploaded { version_id, .. }) if version_id == version.version_id
        ));
        assert_eq!(ts.store.objects.get_bucket(bucket.id).await.unwrap().size, 10);
    }

    #[tokio::test]
    async fn missing_part_fails_and_keeps_staging() {
        let ts = TestStore::new().await;
        let bucket = ts.bucket().await;
        let multipart = &ts.store.multipart;

        let upload = multipart.initiate(bucket.id, "big.bin", 10, 5).await.unwrap();
        multipart
            .upload_part(upload.upload_id, 0, bytes_stream("hello"))
            .await
            .unwrap();

        let err = multipart.complete(upload.upload_id).await.unwrap_err();
        assert!(matches!(err, FilesError::MultipartValidation(_)));
        assert_eq!(multipart.list_parts(upload.upload_id).await.unwrap().len(), 1);
        assert!(!multipart.get_upload(upload.upload_id).await.unwrap().completed);
        assert!(ts.store.files.get(upload.file_id).await.unwrap().writable);

        // The upload can still be finished afterwards.
        multipart
            .upload_part(upload.upload_id, 1, bytes_stream("world"))
            .await
            .unwrap();
        multipart.complete(upload.upload_id).await.unwrap();
    }

    #[tokio::test]
    async fn corrupted_part_bytes_fail_validation() {
        let ts = TestStore::new().await;
        let bucket = ts.bucket().await;
        let multipart = &ts.store.multipart;

        let upload = multipart.initiate(bucket.id, "big.bin", 6, 3).await.unwrap();
        multipart
            .upload_part(upload.upload_id, 0, bytes_stream("abc"))
            .await
            .unwrap();
        multipart
            .upload_part(upload.upload_id, 1, bytes_stream("def"))
            .await
            .unwrap();
        let file = ts.store.files.get(upload.file_id).await.unwrap();
        ts.overwrite_physical(&file, b"abcXYZ");

        let err = multipart.complete(upload.upload_id).await.unwrap_err();
        assert!(matches!(err, FilesError::MultipartValidation(msg) if msg.contains("part 1")));
    }

    #[tokio::test]
    async fn backend_failure_during_complete_keeps_its_kind() {
        let ts = TestStore::new().await;
        let bucket = ts.bucket().await;
        let multipart = &ts.store.multipart;

        let upload = multipart.initiate(bucket.id, "big.bin", 10, 5).await.unwrap();
        multipart
            .upload_part(upload.upload_id, 0, bytes_stream("hello"))
            .await
            .unwrap();
        multipart
            .upload_part(upload.upload_id, 1, bytes_stream("world"))
            .await
            .unwrap();
        let file = ts.store.files.get(upload.file_id).await.unwrap();
        std::fs::remove_file(&file.uri).unwrap();

        let err = multipart.complete(upload.upload_id).await.unwrap_err();
        assert!(matches!(err, FilesError::StorageBackend(_)));
        assert_eq!(err.code(), "StorageBackend");

        let app = AppError::from(err);
        assert_eq!(app.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!app.message.contains(&file.uri));
        assert!(!multipart.get_upload(upload.upload_id).await.unwrap().completed);
    }

    #[tokio::test]
    async fn completion_waits_for_part_writes_in_flight() {
        let ts = TestStore::new().await;
        let bucket = ts.bucket().await;
        let multipart = ts.store.multipart.clone();

        let upload = multipart.initiate(bucket.id, "big.bin", 10, 5).await.unwrap();
        let upload_id = upload.upload_id;
        multipart
            .upload_part(upload_id, 0, bytes_stream("hello"))
            .await
            .unwrap();
        multipart
            .upload_part(upload_id, 1, bytes_stream("world"))
            .await
            .unwrap();

        // Re-upload part 0 with a body that stalls until released.
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let body = stream::once(async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
            Ok::<_, io::Error>(Bytes::from_static(b"HELLO"))
        });
        let writer = tokio::spawn({
            let multipart = multipart.clone();
            async move { multipart.upload_part(upload_id, 0, body).await }
        });
        started_rx.await.unwrap();

        let completer = tokio::spawn({
            let multipart = multipart.clone();
            async move { multipart.complete(upload_id).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!completer.is_finished());

        release_tx.send(()).unwrap();
        writer.await.unwrap().unwrap();
        let version = completer.await.unwrap().unwrap();

        let file = ts.store.files.get(version.file_id.unwrap()).await.unwrap();
        assert_eq!(file.checksum.as_deref(), Some(ts.digest(b"HELLOworld").as_str()));
        let opened = ts.store.objects.open_object(version, None).await.unwrap();
        assert_eq!(read_to_vec(opened.reader).await, b"HELLOworld");

        // Once finalized, no part can touch the file again.
        let err = multipart
            .upload_part(upload_id, 0, bytes_stream("late!"))
            .await
            .unwrap_err();
        assert!(matches!(err, FilesError::InvalidOperation(_)));
        assert!(multipart.list_parts(upload_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn part_layout_is_enforced() {
        let ts = TestStore::new().await;
        let bucket = ts.bucket().await;
        let multipart = &ts.store.multipart;

        let upload = multipart.initiate(bucket.id, "f", 7, 4).await.unwrap();
        let err = multipart
            .upload_part(upload.upload_id, 2, bytes_stream("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, FilesError::MultipartValidation(_)));

        // The last part holds the remainder.
        let err = multipart
            .upload_part(upload.upload_id, 1, bytes_stream("xxxx"))
            .await
            .unwrap_err();
        assert!(matches!(err, FilesError::SizeMismatch { expected: 3, .. }));
        multipart
            .upload_part(upload.upload_id, 1, bytes_stream("xyz"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn initiate_checks_bucket_limits() {
        let ts = TestStore::new().await;
        let bucket = ts
            .store
            .objects
            .create_bucket(CreateBucket {
                quota_size: Some(100),
                max_file_size: Some(50),
                ..CreateBucket::default()
            })
            .await
            .unwrap();
        let multipart = &ts.store.multipart;

        let err = multipart.initiate(bucket.id, "f", 60, 10).await.unwrap_err();
        assert!(matches!(err, FilesError::FileTooLarge { limit: 50 }));
        let err = multipart.initiate(bucket.id, "f", 0, 10).await.unwrap_err();
        assert!(matches!(err, FilesError::MultipartValidation(_)));
        let err = multipart.initiate(bucket.id, "f", 10, 0).await.unwrap_err();
        assert!(matches!(err, FilesError::MultipartValidation(_)));
        assert_eq!(ts.physical_file_count(), 0);
    }

    #[tokio::test]
    async fn abort_releases_reserved_file() {
        let ts = TestStore::new().await;
        let bucket = ts.bucket().await;
        let multipart = &ts.store.multipart;

        let upload = multipart.initiate(bucket.id, "f", 4, 2).await.unwrap();
        multipart
            .upload_part(upload.upload_id, 0, bytes_stream("ab"))
            .await
            .unwrap();
        assert_eq!(ts.physical_file_count(), 1);

        multipart.abort(upload.upload_id).await.unwrap();
        assert!(matches!(
            multipart.get_upload(upload.upload_id).await,
            Err(FilesError::NotFound { kind: ResourceKind::Upload, .. })
        ));
        assert!(matches!(
            ts.store.files.get(upload.file_id).await,
            Err(FilesError::NotFound { .. })
        ));
        assert_eq!(ts.physical_file_count(), 0);
    }

    #[tokio::test]
    async fn expiry_reclaims_stale_uploads_only() {
        let ts = TestStore::new().await;
        let bucket = ts.bucket().await;
        let multipart = &ts.store.multipart;

        let stale = multipart.initiate(bucket.id, "old", 4, 2).await.unwrap();
        let fresh = multipart.initiate(bucket.id, "new", 4, 2).await.unwrap();
        sqlx::query("UPDATE multipart_uploads SET created_at = ? WHERE upload_id = ?")
            .bind(Utc::now() - Duration::days(10))
            .bind(stale.upload_id)
            .execute(&*ts.store.db)
            .await
            .unwrap();

        let report = multipart.remove_expired(Duration::days(1)).await.unwrap();
        assert_eq!(report, ExpiryReport { aborted: 1, purged: 0 });
        assert!(multipart.get_upload(stale.upload_id).await.is_err());
        assert!(multipart.get_upload(fresh.upload_id).await.is_ok());
        let remaining = multipart.list_uploads(bucket.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(ts.physical_file_count(), 1);
    }
}
