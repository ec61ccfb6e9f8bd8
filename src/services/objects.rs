//! Bucket and object version engine.
//!
//! Every mutation of a key appends a version and moves the HEAD pointer inside
//! one transaction. HEAD uniqueness is enforced twice: a partial unique index
//! on `(bucket_id, key) WHERE is_head = 1`, and a compare-and-swap on the
//! previous HEAD so a stale writer fails even on stores without partial
//! indexes. Either rejection surfaces as [`FilesError::IntegrityConflict`];
//! retrying is left to the caller (see [`super::with_retry`]).

use crate::{
    errors::{FilesError, FilesResult, ResourceKind, conflict_or_sqlx},
    models::{
        bucket::{BUCKET_COLUMNS, Bucket},
        file_instance::FileInstance,
        location::{LOCATION_COLUMNS, Location},
        object_version::{VERSION_COLUMNS, ObjectVersion},
    },
    services::{
        events::{Event, EventBus},
        files::{FileRegistry, StagedFile, fetch_file},
        range::ByteRange,
    },
    storage::BoxReader,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, TryStreamExt, stream};
use serde::Serialize;
use sqlx::{Executor, FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    sync::Arc,
};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MAX_LOCATION_NAME_LEN: usize = 20;
const MAX_LIST_KEYS: usize = 1000;

/// Backend used for buckets created without an explicit storage class.
pub const DEFAULT_STORAGE_CLASS: &str = "fs";

#[derive(Clone, Debug, Default)]
pub struct CreateBucket {
    /// Location name; the default location when absent.
    pub location: Option<String>,
    /// Backend name; [`DEFAULT_STORAGE_CLASS`] when absent.
    pub storage_class: Option<String>,
    pub quota_size: Option<u64>,
    pub max_file_size: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct ListObjectsParams {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub continuation_token: Option<String>,
    pub start_after: Option<String>,
    pub max_keys: usize,
}

impl Default for ListObjectsParams {
    fn default() -> Self {
        Self {
            prefix: None,
            delimiter: None,
            continuation_token: None,
            start_after: None,
            max_keys: MAX_LIST_KEYS,
        }
    }
}

/// A live HEAD version joined with its file instance.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct ObjectSummary {
    pub key: String,
    pub version_id: Uuid,
    pub file_id: Uuid,
    pub size: i64,
    pub checksum: Option<String>,
    pub readable: bool,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ListObjectsResult {
    pub objects: Vec<ObjectSummary>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
    pub key_count: usize,
}

/// Something `sync_bucket` found out of line with the version table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncDiscrepancy {
    /// The recorded size differed from the sum of distinct HEAD files.
    SizeDrift { recorded: i64, actual: i64 },
    /// A HEAD version points at a file that failed verification.
    UnreadableHead {
        key: String,
        version_id: Uuid,
        file_id: Uuid,
    },
}

/// An opened object ready to stream out.
pub struct ObjectReader {
    pub version: ObjectVersion,
    pub file: FileInstance,
    /// Resolved range when one was requested.
    pub range: Option<ByteRange>,
    /// Number of bytes `reader` yields.
    pub length: u64,
    pub reader: BoxReader,
}

#[derive(Clone)]
pub struct ObjectService {
    db: Arc<SqlitePool>,
    files: FileRegistry,
    events: EventBus,
}

impl ObjectService {
    pub fn new(db: Arc<SqlitePool>, files: FileRegistry, events: EventBus) -> Self {
        Self { db, files, events }
    }

    // ---------------------------------------------------------------------
    // Locations
    // ---------------------------------------------------------------------

    /// Register a location. Making it the default clears the previous default
    /// in the same transaction.
    pub async fn create_location(
        &self,
        name: &str,
        uri: &str,
        default: bool,
    ) -> FilesResult<Location> {
        validate_location_name(name)?;

        let mut tx = self.db.begin().await?;
        if default {
            sqlx::query("UPDATE locations SET is_default = 0 WHERE is_default = 1")
                .execute(&mut *tx)
                .await
                .map_err(|err| conflict_or_sqlx(err, || "default location changed".into()))?;
        }
        let location = sqlx::query_as::<_, Location>(&format!(
            "INSERT INTO locations ({LOCATION_COLUMNS}) VALUES (?, ?, ?, ?, ?)
             RETURNING {LOCATION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(uri)
        .bind(default)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| conflict_or_sqlx(err, || format!("location `{}` already exists", name)))?;
        tx.commit().await?;

        info!(location = %location.name, uri = %location.uri, default, "created location");
        Ok(location)
    }

    pub async fn list_locations(&self) -> FilesResult<Vec<Location>> {
        let locations = sqlx::query_as::<_, Location>(&format!(
            "SELECT {LOCATION_COLUMNS} FROM locations ORDER BY name ASC"
        ))
        .fetch_all(&*self.db)
        .await?;
        Ok(locations)
    }

    pub async fn get_location(&self, name: &str) -> FilesResult<Location> {
        sqlx::query_as::<_, Location>(&format!(
            "SELECT {LOCATION_COLUMNS} FROM locations WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| FilesError::not_found(ResourceKind::Location, name))
    }

    pub async fn default_location(&self) -> FilesResult<Location> {
        sqlx::query_as::<_, Location>(&format!(
            "SELECT {LOCATION_COLUMNS} FROM locations WHERE is_default = 1"
        ))
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| FilesError::not_found(ResourceKind::Location, "default"))
    }

    /// Make `name` the default location.
    pub async fn set_default_location(&self, name: &str) -> FilesResult<Location> {
        let mut tx = self.db.begin().await?;
        sqlx::query("UPDATE locations SET is_default = 0 WHERE is_default = 1 AND name <> ?")
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(|err| conflict_or_sqlx(err, || "default location changed".into()))?;
        let location = sqlx::query_as::<_, Location>(&format!(
            "UPDATE locations SET is_default = 1 WHERE name = ? RETURNING {LOCATION_COLUMNS}"
        ))
        .bind(name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|err| conflict_or_sqlx(err, || "default location changed".into()))?
        .ok_or_else(|| FilesError::not_found(ResourceKind::Location, name))?;
        tx.commit().await?;
        Ok(location)
    }

    // ---------------------------------------------------------------------
    // Buckets
    // ---------------------------------------------------------------------

    pub async fn create_bucket(&self, req: CreateBucket) -> FilesResult<Bucket> {
        let location = match &req.location {
            Some(name) => self.get_location(name).await?,
            None => self.default_location().await?,
        };
        let storage_class = req
            .storage_class
            .unwrap_or_else(|| DEFAULT_STORAGE_CLASS.to_string());
        if !self.files.backends().contains(&storage_class) {
            return Err(FilesError::InvalidOperation(format!(
                "storage class `{}` is not registered",
                storage_class
            )));
        }

        let now = Utc::now();
        let bucket = sqlx::query_as::<_, Bucket>(&format!(
            "INSERT INTO buckets ({BUCKET_COLUMNS}) VALUES (?, ?, ?, 0, ?, ?, 0, 0, ?, ?)
             RETURNING {BUCKET_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(location.id)
        .bind(&storage_class)
        .bind(req.quota_size.map(|v| v as i64))
        .bind(req.max_file_size.map(|v| v as i64))
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await?;

        info!(bucket_id = %bucket.id, location = %location.name, %storage_class, "created bucket");
        Ok(bucket)
    }

    /// A bucket that has not been removed.
    pub async fn get_bucket(&self, bucket_id: Uuid) -> FilesResult<Bucket> {
        live(fetch_bucket(&*self.db, bucket_id).await?)
    }

    pub async fn list_buckets(&self) -> FilesResult<Vec<Bucket>> {
        let buckets = sqlx::query_as::<_, Bucket>(&format!(
            "SELECT {BUCKET_COLUMNS} FROM buckets WHERE deleted = 0 ORDER BY created_at ASC"
        ))
        .fetch_all(&*self.db)
        .await?;
        Ok(buckets)
    }

    pub async fn set_locked(&self, bucket_id: Uuid, locked: bool) -> FilesResult<Bucket> {
        sqlx::query_as::<_, Bucket>(&format!(
            "UPDATE buckets SET locked = ?, updated_at = ? WHERE id = ? AND deleted = 0
             RETURNING {BUCKET_COLUMNS}"
        ))
        .bind(locked)
        .bind(Utc::now())
        .bind(bucket_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| FilesError::not_found(ResourceKind::Bucket, bucket_id))
    }

    // ---------------------------------------------------------------------
    // Objects
    // ---------------------------------------------------------------------

    /// Write bytes for a future version of an object in `bucket_id` without
    /// touching metadata. Pair with [`Self::commit_staged`].
    pub async fn stage_object<S>(
        &self,
        bucket_id: Uuid,
        stream: S,
        size: Option<u64>,
    ) -> FilesResult<StagedFile>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let bucket = writable(fetch_bucket(&*self.db, bucket_id).await?)?;
        let location = fetch_location(&*self.db, bucket.location_id).await?;
        self.files
            .stage(
                &location,
                &bucket.storage_class,
                stream,
                size,
                bucket.max_file_size.map(|v| v as u64),
            )
            .await
    }

    /// Record staged bytes as the new HEAD of `key`.
    ///
    /// The staged bytes are left in place on failure so the call can be
    /// retried; discard them once giving up.
    pub async fn commit_staged(
        &self,
        bucket_id: Uuid,
        key: &str,
        staged: &StagedFile,
    ) -> FilesResult<ObjectVersion> {
        validate_key(key)?;
        let mut tx = self.db.begin().await?;
        let file = FileRegistry::insert_staged(&mut tx, staged).await?;
        let version = commit_version(&mut tx, bucket_id, key, Some(&file)).await?;
        tx.commit()
            .await
            .map_err(|err| conflict_or_sqlx(err, || format!("concurrent update of `{}`", key)))?;

        self.publish_uploaded(&version, file.id);
        Ok(version)
    }

    /// Store `stream` as the new HEAD of `key`.
    pub async fn put_object<S>(
        &self,
        bucket_id: Uuid,
        key: &str,
        stream: S,
        size: Option<u64>,
    ) -> FilesResult<ObjectVersion>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        validate_key(key)?;
        let staged = self.stage_object(bucket_id, stream, size).await?;
        match self.commit_staged(bucket_id, key, &staged).await {
            Ok(version) => Ok(version),
            Err(err) => {
                self.files.discard(&staged).await;
                Err(err)
            }
        }
    }

    /// New HEAD of `key` reusing an existing finalized file instance.
    pub async fn put_file(
        &self,
        bucket_id: Uuid,
        key: &str,
        file_id: Uuid,
    ) -> FilesResult<ObjectVersion> {
        validate_key(key)?;
        let mut tx = self.db.begin().await?;
        let file = fetch_file(&mut *tx, file_id).await?;
        if file.writable {
            return Err(FilesError::InvalidOperation(format!(
                "file {} is still being written",
                file_id
            )));
        }
        if !file.readable {
            return Err(FilesError::FileUnreadable(file_id));
        }
        let version = commit_version(&mut tx, bucket_id, key, Some(&file)).await?;
        tx.commit()
            .await
            .map_err(|err| conflict_or_sqlx(err, || format!("concurrent update of `{}`", key)))?;

        self.publish_uploaded(&version, file_id);
        Ok(version)
    }

    /// Hide `key` behind a delete marker. Earlier versions stay readable by id.
    pub async fn delete_object(&self, bucket_id: Uuid, key: &str) -> FilesResult<ObjectVersion> {
        validate_key(key)?;
        let mut tx = self.db.begin().await?;
        let marker = commit_version(&mut tx, bucket_id, key, None).await?;
        tx.commit()
            .await
            .map_err(|err| conflict_or_sqlx(err, || format!("concurrent update of `{}`", key)))?;

        info!(%bucket_id, key, version_id = %marker.version_id, "object deleted");
        self.events.publish(Event::ObjectDeleted {
            bucket_id,
            key: key.to_string(),
            version_id: marker.version_id,
        });
        Ok(marker)
    }

    /// The HEAD of `key`, or exactly `version_id` when given.
    pub async fn get_object(
        &self,
        bucket_id: Uuid,
        key: &str,
        version_id: Option<Uuid>,
    ) -> FilesResult<ObjectVersion> {
        validate_key(key)?;
        self.get_bucket(bucket_id).await?;

        let version = match version_id {
            Some(version_id) => sqlx::query_as::<_, ObjectVersion>(&format!(
                "SELECT {VERSION_COLUMNS} FROM object_versions
                 WHERE bucket_id = ? AND key = ? AND version_id = ?"
            ))
            .bind(bucket_id)
            .bind(key)
            .bind(version_id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| FilesError::not_found(ResourceKind::Version, version_id))?,
            None => fetch_head(&*self.db, bucket_id, key)
                .await?
                .ok_or_else(|| FilesError::not_found(ResourceKind::Object, key))?,
        };

        if version.is_delete_marker() {
            return Err(match version_id {
                Some(version_id) => FilesError::not_found(ResourceKind::Version, version_id),
                None => FilesError::not_found(ResourceKind::Object, key),
            });
        }
        if let Some(file_id) = version.file_id {
            let readable: bool =
                sqlx::query_scalar("SELECT readable FROM file_instances WHERE id = ?")
                    .bind(file_id)
                    .fetch_optional(&*self.db)
                    .await?
                    .ok_or_else(|| FilesError::not_found(ResourceKind::File, file_id))?;
            if !readable {
                return Err(FilesError::FileUnreadable(file_id));
            }
        }
        Ok(version)
    }

    /// Open the bytes behind `version`, honouring an optional `Range` header.
    pub async fn open_object(
        &self,
        version: ObjectVersion,
        range: Option<&str>,
    ) -> FilesResult<ObjectReader> {
        let file_id = version
            .file_id
            .ok_or_else(|| FilesError::not_found(ResourceKind::Object, &version.key))?;
        let file = self.files.get(file_id).await?;
        if !file.readable {
            return Err(FilesError::FileUnreadable(file_id));
        }

        let size = file.size_bytes();
        let range = range
            .map(|header| ByteRange::parse(header, size))
            .transpose()?;
        let backend = self.files.backend_for(&file)?;
        let (reader, length) = match range {
            Some(range) => {
                let reader: BoxReader =
                    Box::pin(backend.open_at(range.start).await?.take(range.len()));
                (reader, range.len())
            }
            None => (backend.open().await?, size),
        };

        debug!(%file_id, length, ?range, "opened object");
        Ok(ObjectReader {
            version,
            file,
            range,
            length,
            reader,
        })
    }

    /// One page of live objects ordered by key.
    pub async fn list_objects(
        &self,
        bucket_id: Uuid,
        params: ListObjectsParams,
    ) -> FilesResult<ListObjectsResult> {
        self.get_bucket(bucket_id).await?;
        let max_keys = params.max_keys.clamp(1, MAX_LIST_KEYS);
        let fetch_limit = max_keys + 1;

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT v.key, v.version_id, v.file_id, f.size, f.checksum, f.readable, \
             v.updated_at AS last_modified \
             FROM object_versions v JOIN file_instances f ON f.id = v.file_id \
             WHERE v.is_head = 1 AND v.bucket_id = ",
        );
        builder.push_bind(bucket_id);

        if let Some(prefix) = &params.prefix {
            builder.push(" AND substr(v.key, 1, length(");
            builder.push_bind(prefix);
            builder.push(")) = ");
            builder.push_bind(prefix);
        }

        if let Some(token) = params
            .continuation_token
            .as_ref()
            .or(params.start_after.as_ref())
        {
            builder.push(" AND v.key > ");
            builder.push_bind(token);
        }

        builder.push(" ORDER BY v.key ASC LIMIT ");
        builder.push_bind(fetch_limit as i64);

        let mut rows: Vec<ObjectSummary> = builder.build_query_as().fetch_all(&*self.db).await?;

        let mut is_truncated = false;
        let mut next_continuation_token = None;
        if rows.len() == fetch_limit {
            rows.pop();
            next_continuation_token = rows.last().map(|obj| {
                // A rolled-up last row resumes after its whole group.
                params
                    .delimiter
                    .as_deref()
                    .and_then(|delim| {
                        compute_common_prefix(&obj.key, params.prefix.as_deref(), delim)
                    })
                    .map(|group| format!("{}{}", group, char::MAX))
                    .unwrap_or_else(|| obj.key.clone())
            });
            is_truncated = true;
        }

        let mut contents = Vec::new();
        let mut common_prefixes = BTreeSet::new();
        for obj in rows.into_iter() {
            if let Some(delim) = &params.delimiter {
                if let Some(prefix) =
                    compute_common_prefix(&obj.key, params.prefix.as_deref(), delim)
                {
                    common_prefixes.insert(prefix);
                    continue;
                }
            }
            contents.push(obj);
        }

        let key_count = contents.len() + common_prefixes.len();

        Ok(ListObjectsResult {
            objects: contents,
            common_prefixes: common_prefixes.into_iter().collect(),
            is_truncated,
            next_continuation_token,
            key_count,
        })
    }

    /// Lazy stream over every live object under `prefix`, fetched a page at a
    /// time. Restart after the last key seen by passing it as `start_after`.
    pub fn object_stream(
        &self,
        bucket_id: Uuid,
        prefix: Option<String>,
        start_after: Option<String>,
        page_size: usize,
    ) -> impl Stream<Item = FilesResult<ObjectSummary>> + Send + '_ {
        stream::try_unfold(Some(start_after), move |cursor| {
            let prefix = prefix.clone();
            async move {
                let Some(after) = cursor else {
                    return Ok(None);
                };
                let page = self
                    .list_objects(
                        bucket_id,
                        ListObjectsParams {
                            prefix,
                            start_after: after,
                            max_keys: page_size,
                            ..ListObjectsParams::default()
                        },
                    )
                    .await?;
                let next = page
                    .is_truncated
                    .then_some(page.next_continuation_token);
                let items = stream::iter(page.objects.into_iter().map(Ok::<_, FilesError>));
                Ok::<_, FilesError>(Some((items, next)))
            }
        })
        .try_flatten()
    }

    /// Every version in the bucket, or of one key, newest first per key.
    pub async fn list_versions(
        &self,
        bucket_id: Uuid,
        key: Option<&str>,
    ) -> FilesResult<Vec<ObjectVersion>> {
        self.get_bucket(bucket_id).await?;
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {VERSION_COLUMNS} FROM object_versions WHERE bucket_id = "
        ));
        builder.push_bind(bucket_id);
        if let Some(key) = key {
            builder.push(" AND key = ");
            builder.push_bind(key);
        }
        builder.push(" ORDER BY key ASC, created_at DESC, rowid DESC");
        let versions = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(versions)
    }

    /// Permanently drop one version. When it was the HEAD, the newest
    /// remaining version of the key takes over.
    pub async fn remove_version(
        &self,
        bucket_id: Uuid,
        key: &str,
        version_id: Uuid,
    ) -> FilesResult<ObjectVersion> {
        validate_key(key)?;
        let mut tx = self.db.begin().await?;
        let bucket = writable(fetch_bucket(&mut *tx, bucket_id).await?)?;

        let removed = sqlx::query_as::<_, ObjectVersion>(&format!(
            "DELETE FROM object_versions WHERE bucket_id = ? AND key = ? AND version_id = ?
             RETURNING {VERSION_COLUMNS}"
        ))
        .bind(bucket_id)
        .bind(key)
        .bind(version_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|err| conflict_or_sqlx(err, || format!("concurrent update of `{}`", key)))?
        .ok_or_else(|| FilesError::not_found(ResourceKind::Version, version_id))?;

        if removed.is_head {
            let promoted = sqlx::query_as::<_, ObjectVersion>(&format!(
                "UPDATE object_versions SET is_head = 1, updated_at = ?
                 WHERE version_id = (
                     SELECT version_id FROM object_versions
                     WHERE bucket_id = ? AND key = ?
                     ORDER BY created_at DESC, rowid DESC LIMIT 1
                 )
                 RETURNING {VERSION_COLUMNS}"
            ))
            .bind(Utc::now())
            .bind(bucket_id)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|err| conflict_or_sqlx(err, || format!("concurrent update of `{}`", key)))?;

            let new_file = promoted.as_ref().and_then(|v| v.file_id);
            apply_head_change(&mut tx, &bucket, removed.file_id, new_file, false).await?;
        }
        tx.commit()
            .await
            .map_err(|err| conflict_or_sqlx(err, || format!("concurrent update of `{}`", key)))?;

        info!(%bucket_id, key, %version_id, "removed object version");
        self.events.publish(Event::ObjectDeleted {
            bucket_id,
            key: key.to_string(),
            version_id,
        });
        Ok(removed)
    }

    // ---------------------------------------------------------------------
    // Bucket maintenance
    // ---------------------------------------------------------------------

    /// Recompute the bucket size from its HEAD versions and report every
    /// difference found. Drift is corrected; unreadable HEADs are only
    /// reported.
    pub async fn sync_bucket(
        &self,
        bucket_id: Uuid,
    ) -> FilesResult<(Bucket, Vec<SyncDiscrepancy>)> {
        let mut tx = self.db.begin().await?;
        let mut bucket = live(fetch_bucket(&mut *tx, bucket_id).await?)?;
        let mut discrepancies = Vec::new();

        let actual = head_size(&mut tx, bucket_id).await?;
        if actual != bucket.size {
            warn!(%bucket_id, recorded = bucket.size, actual, "bucket size drifted");
            discrepancies.push(SyncDiscrepancy::SizeDrift {
                recorded: bucket.size,
                actual,
            });
            bucket = sqlx::query_as::<_, Bucket>(&format!(
                "UPDATE buckets SET size = ?, updated_at = ? WHERE id = ? RETURNING {BUCKET_COLUMNS}"
            ))
            .bind(actual)
            .bind(Utc::now())
            .bind(bucket_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|err| conflict_or_sqlx(err, || format!("bucket {} changed", bucket_id)))?;
        }

        let unreadable: Vec<(String, Uuid, Uuid)> = sqlx::query_as(
            "SELECT v.key, v.version_id, f.id
             FROM object_versions v JOIN file_instances f ON f.id = v.file_id
             WHERE v.bucket_id = ? AND v.is_head = 1 AND f.readable = 0 AND f.writable = 0
             ORDER BY v.key ASC",
        )
        .bind(bucket_id)
        .fetch_all(&mut *tx)
        .await?;
        discrepancies.extend(unreadable.into_iter().map(|(key, version_id, file_id)| {
            SyncDiscrepancy::UnreadableHead {
                key,
                version_id,
                file_id,
            }
        }));

        tx.commit().await?;
        Ok((bucket, discrepancies))
    }

    /// Logically remove a bucket. Its versions survive until purged.
    pub async fn remove_bucket(&self, bucket_id: Uuid) -> FilesResult<Bucket> {
        writable(fetch_bucket(&*self.db, bucket_id).await?)?;
        let bucket = sqlx::query_as::<_, Bucket>(&format!(
            "UPDATE buckets SET deleted = 1, updated_at = ? WHERE id = ? AND deleted = 0
             RETURNING {BUCKET_COLUMNS}"
        ))
        .bind(Utc::now())
        .bind(bucket_id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| FilesError::not_found(ResourceKind::Bucket, bucket_id))?;

        info!(%bucket_id, "bucket removed");
        Ok(bucket)
    }

    /// Irreversibly drop a removed bucket with all its versions, uploads and
    /// tags. File instances left unreferenced are reclaimed by the orphan
    /// cleaner. Returns the number of versions dropped.
    pub async fn purge_bucket(&self, bucket_id: Uuid) -> FilesResult<u64> {
        let mut tx = self.db.begin().await?;
        let bucket = fetch_bucket(&mut *tx, bucket_id).await?;
        if !bucket.deleted {
            return Err(FilesError::InvalidOperation(format!(
                "bucket {} must be removed before it is purged",
                bucket_id
            )));
        }

        let versions = sqlx::query("DELETE FROM object_versions WHERE bucket_id = ?")
            .bind(bucket_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM multipart_uploads WHERE bucket_id = ?")
            .bind(bucket_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM buckets WHERE id = ?")
            .bind(bucket_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(%bucket_id, versions, "bucket purged");
        Ok(versions)
    }

    /// Copy a bucket's live state into a new bucket. The copy's HEAD versions
    /// share file instances with the source.
    pub async fn snapshot_bucket(&self, bucket_id: Uuid) -> FilesResult<Bucket> {
        let mut tx = self.db.begin().await?;
        let source = live(fetch_bucket(&mut *tx, bucket_id).await?)?;
        let now = Utc::now();
        let snapshot_id = Uuid::new_v4();

        sqlx::query(&format!(
            "INSERT INTO buckets ({BUCKET_COLUMNS}) VALUES (?, ?, ?, 0, ?, ?, 0, 0, ?, ?)"
        ))
        .bind(snapshot_id)
        .bind(source.location_id)
        .bind(&source.storage_class)
        .bind(source.quota_size)
        .bind(source.max_file_size)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let heads: Vec<(String, Uuid)> = sqlx::query_as(
            "SELECT key, file_id FROM object_versions
             WHERE bucket_id = ? AND is_head = 1 AND file_id IS NOT NULL",
        )
        .bind(bucket_id)
        .fetch_all(&mut *tx)
        .await?;
        for (key, file_id) in &heads {
            sqlx::query(&format!(
                "INSERT INTO object_versions ({VERSION_COLUMNS}) VALUES (?, ?, ?, ?, 1, ?, ?)"
            ))
            .bind(snapshot_id)
            .bind(key)
            .bind(Uuid::new_v4())
            .bind(file_id)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO bucket_tags (bucket_id, key, value)
             SELECT ?, key, value FROM bucket_tags WHERE bucket_id = ?",
        )
        .bind(snapshot_id)
        .bind(bucket_id)
        .execute(&mut *tx)
        .await?;

        let size = head_size(&mut tx, snapshot_id).await?;
        let snapshot = sqlx::query_as::<_, Bucket>(&format!(
            "UPDATE buckets SET size = ? WHERE id = ? RETURNING {BUCKET_COLUMNS}"
        ))
        .bind(size)
        .bind(snapshot_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(source = %bucket_id, snapshot = %snapshot_id, objects = heads.len(), "bucket snapshot created");
        Ok(snapshot)
    }

    // ---------------------------------------------------------------------
    // Tags
    // ---------------------------------------------------------------------

    pub async fn set_object_tags(
        &self,
        version_id: Uuid,
        tags: &BTreeMap<String, String>,
    ) -> FilesResult<()> {
        let mut tx = self.db.begin().await?;
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM object_versions WHERE version_id = ?")
                .bind(version_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(FilesError::not_found(ResourceKind::Version, version_id));
        }
        for (key, value) in tags {
            sqlx::query(
                "INSERT INTO object_version_tags (version_id, key, value) VALUES (?, ?, ?)
                 ON CONFLICT(version_id, key) DO UPDATE SET value = excluded.value",
            )
            .bind(version_id)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_object_tags(&self, version_id: Uuid) -> FilesResult<BTreeMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM object_version_tags WHERE version_id = ?")
                .bind(version_id)
                .fetch_all(&*self.db)
                .await?;
        Ok(rows.into_iter().collect())
    }

    /// Returns whether a tag was removed.
    pub async fn delete_object_tag(&self, version_id: Uuid, key: &str) -> FilesResult<bool> {
        let result =
            sqlx::query("DELETE FROM object_version_tags WHERE version_id = ? AND key = ?")
                .bind(version_id)
                .bind(key)
                .execute(&*self.db)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_bucket_tags(
        &self,
        bucket_id: Uuid,
        tags: &BTreeMap<String, String>,
    ) -> FilesResult<()> {
        let mut tx = self.db.begin().await?;
        live(fetch_bucket(&mut *tx, bucket_id).await?)?;
        for (key, value) in tags {
            sqlx::query(
                "INSERT INTO bucket_tags (bucket_id, key, value) VALUES (?, ?, ?)
                 ON CONFLICT(bucket_id, key) DO UPDATE SET value = excluded.value",
            )
            .bind(bucket_id)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_bucket_tags(&self, bucket_id: Uuid) -> FilesResult<BTreeMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM bucket_tags WHERE bucket_id = ?")
                .bind(bucket_id)
                .fetch_all(&*self.db)
                .await?;
        Ok(rows.into_iter().collect())
    }

    fn publish_uploaded(&self, version: &ObjectVersion, file_id: Uuid) {
        info!(
            bucket_id = %version.bucket_id,
            key = %version.key,
            version_id = %version.version_id,
            %file_id,
            "object uploaded"
        );
        self.events.publish(Event::ObjectUploaded {
            bucket_id: version.bucket_id,
            key: version.key.clone(),
            version_id: version.version_id,
            file_id,
        });
    }
}

/// Append a version of `key` pointing at `file` (a delete marker when
/// `None`) and make it the HEAD. Runs inside the caller's transaction.
pub(crate) async fn commit_version(
    conn: &mut SqliteConnection,
    bucket_id: Uuid,
    key: &str,
    file: Option<&FileInstance>,
) -> FilesResult<ObjectVersion> {
    let bucket = writable(fetch_bucket(&mut *conn, bucket_id).await?)?;
    if let (Some(file), Some(limit)) = (file, bucket.max_file_size) {
        if file.size > limit {
            return Err(FilesError::FileTooLarge {
                limit: limit as u64,
            });
        }
    }

    let current = fetch_head(&mut *conn, bucket_id, key).await?;
    if file.is_none() && current.as_ref().is_none_or(|head| head.is_delete_marker()) {
        return Err(FilesError::not_found(ResourceKind::Object, key));
    }
    if let Some(head) = &current {
        swap_head(&mut *conn, head).await?;
    }

    let now = Utc::now();
    let version = sqlx::query_as::<_, ObjectVersion>(&format!(
        "INSERT INTO object_versions ({VERSION_COLUMNS}) VALUES (?, ?, ?, ?, 1, ?, ?)
         RETURNING {VERSION_COLUMNS}"
    ))
    .bind(bucket_id)
    .bind(key)
    .bind(Uuid::new_v4())
    .bind(file.map(|f| f.id))
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await
    .map_err(|err| conflict_or_sqlx(err, || format!("concurrent HEAD for `{}`", key)))?;

    let old_file = current.and_then(|head| head.file_id);
    apply_head_change(conn, &bucket, old_file, file.map(|f| f.id), true).await?;
    Ok(version)
}

/// Demote `expected` from HEAD. Fails when another writer already moved it.
pub(crate) async fn swap_head(
    conn: &mut SqliteConnection,
    expected: &ObjectVersion,
) -> FilesResult<()> {
    let result = sqlx::query(
        "UPDATE object_versions SET is_head = 0, updated_at = ?
         WHERE bucket_id = ? AND key = ? AND version_id = ? AND is_head = 1",
    )
    .bind(Utc::now())
    .bind(expected.bucket_id)
    .bind(&expected.key)
    .bind(expected.version_id)
    .execute(conn)
    .await
    .map_err(|err| conflict_or_sqlx(err, || format!("concurrent HEAD for `{}`", expected.key)))?;

    if result.rows_affected() != 1 {
        return Err(FilesError::IntegrityConflict(format!(
            "HEAD of `{}` moved past version {}",
            expected.key, expected.version_id
        )));
    }
    Ok(())
}

/// Adjust the bucket size after the HEAD of one key moved from `old_file` to
/// `new_file`. Files still headed by another key keep counting once.
async fn apply_head_change(
    conn: &mut SqliteConnection,
    bucket: &Bucket,
    old_file: Option<Uuid>,
    new_file: Option<Uuid>,
    enforce_quota: bool,
) -> FilesResult<()> {
    if old_file == new_file {
        return Ok(());
    }

    let mut delta: i64 = 0;
    if let Some(old) = old_file {
        if head_refs(&mut *conn, bucket.id, old).await? == 0 {
            delta -= fetch_file(&mut *conn, old).await?.size;
        }
    }
    if let Some(new) = new_file {
        if head_refs(&mut *conn, bucket.id, new).await? == 1 {
            delta += fetch_file(&mut *conn, new).await?.size;
        }
    }
    if delta == 0 {
        return Ok(());
    }

    let size = bucket.size + delta;
    if enforce_quota && delta > 0 {
        if let Some(quota) = bucket.quota_size {
            if size > quota {
                return Err(FilesError::QuotaExceeded {
                    bucket_id: bucket.id,
                    quota: quota as u64,
                    size: size.max(0) as u64,
                });
            }
        }
    }

    sqlx::query("UPDATE buckets SET size = size + ?, updated_at = ? WHERE id = ?")
        .bind(delta)
        .bind(Utc::now())
        .bind(bucket.id)
        .execute(conn)
        .await
        .map_err(|err| conflict_or_sqlx(err, || format!("bucket {} changed", bucket.id)))?;
    Ok(())
}

async fn head_refs(conn: &mut SqliteConnection, bucket_id: Uuid, file_id: Uuid) -> FilesResult<i64> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM object_versions WHERE bucket_id = ? AND file_id = ? AND is_head = 1",
    )
    .bind(bucket_id)
    .bind(file_id)
    .fetch_one(conn)
    .await?;
    Ok(count)
}

async fn head_size(conn: &mut SqliteConnection, bucket_id: Uuid) -> FilesResult<i64> {
    let size = sqlx::query_scalar(
        "SELECT COALESCE(SUM(size), 0) FROM file_instances WHERE id IN (
             SELECT file_id FROM object_versions
             WHERE bucket_id = ? AND is_head = 1 AND file_id IS NOT NULL
         )",
    )
    .bind(bucket_id)
    .fetch_one(conn)
    .await?;
    Ok(size)
}

pub(crate) async fn fetch_location<'e, E>(executor: E, location_id: Uuid) -> FilesResult<Location>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, Location>(&format!(
        "SELECT {LOCATION_COLUMNS} FROM locations WHERE id = ?"
    ))
    .bind(location_id)
    .fetch_optional(executor)
    .await?
    .ok_or_else(|| FilesError::not_found(ResourceKind::Location, location_id))
}

pub(crate) async fn fetch_bucket<'e, E>(executor: E, bucket_id: Uuid) -> FilesResult<Bucket>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, Bucket>(&format!("SELECT {BUCKET_COLUMNS} FROM buckets WHERE id = ?"))
        .bind(bucket_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| FilesError::not_found(ResourceKind::Bucket, bucket_id))
}

async fn fetch_head<'e, E>(executor: E, bucket_id: Uuid, key: &str) -> FilesResult<Option<ObjectVersion>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let head = sqlx::query_as::<_, ObjectVersion>(&format!(
        "SELECT {VERSION_COLUMNS} FROM object_versions
         WHERE bucket_id = ? AND key = ? AND is_head = 1"
    ))
    .bind(bucket_id)
    .bind(key)
    .fetch_optional(executor)
    .await?;
    Ok(head)
}

fn live(bucket: Bucket) -> FilesResult<Bucket> {
    if bucket.deleted {
        return Err(FilesError::not_found(ResourceKind::Bucket, bucket.id));
    }
    Ok(bucket)
}

/// A bucket that accepts mutations.
pub(crate) fn writable(bucket: Bucket) -> FilesResult<Bucket> {
    let bucket = live(bucket)?;
    if bucket.locked {
        return Err(FilesError::BucketLocked(bucket.id));
    }
    Ok(bucket)
}

/// Basic key validation to avoid trivial path traversal vectors.
pub(crate) fn validate_key(key: &str) -> FilesResult<()> {
    if key.is_empty() {
        return Err(FilesError::InvalidKey("key is empty".into()));
    }
    if key.len() > MAX_OBJECT_KEY_LEN {
        return Err(FilesError::InvalidKey(format!(
            "key exceeds {} bytes",
            MAX_OBJECT_KEY_LEN
        )));
    }
    if key.starts_with('/') || key.contains("..") {
        return Err(FilesError::InvalidKey(
            "key must be relative and must not contain `..`".into(),
        ));
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(FilesError::InvalidKey(
            "key contains control characters".into(),
        ));
    }
    Ok(())
}

/// Location names are slugs: a lower-case letter followed by lower-case
/// letters, digits or dashes.
fn validate_location_name(name: &str) -> FilesResult<()> {
    let mut chars = name.chars();
    let valid = name.len() >= 2
        && name.len() <= MAX_LOCATION_NAME_LEN
        && chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-'));
    if valid {
        Ok(())
    } else {
        Err(FilesError::InvalidLocationName(name.to_string()))
    }
}

/// Compute a synthetic "common prefix" for S3 list semantics.
///
/// Used only when a delimiter is provided. Returns Some(prefix) if the key
/// belongs to a grouped prefix, otherwise None.
fn compute_common_prefix(
    key: &str,
    requested_prefix: Option<&str>,
    delimiter: &str,
) -> Option<String> {
    let after_prefix = match requested_prefix {
        Some(prefix) => key.strip_prefix(prefix)?,
        None => key,
    };

    let pos = after_prefix.find(delimiter)?;
    let mut combined = String::new();
    if let Some(prefix) = requested_prefix {
        combined.push_str(prefix);
    }
    combined.push_str(&after_prefix[..pos + delimiter.len()]);
    Some(combined)
}
