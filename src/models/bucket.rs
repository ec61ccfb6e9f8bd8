//! Represents a logical bucket, the top-level container for versioned objects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub(crate) const BUCKET_COLUMNS: &str = "id, location_id, storage_class, size, quota_size, \
     max_file_size, locked, deleted, created_at, updated_at";

/// A storage bucket.
///
/// Buckets are bound to one location and one storage backend. Removing a
/// bucket only sets `deleted`; its versions survive until the bucket is purged.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Bucket {
    /// Unique identifier for this bucket.
    pub id: Uuid,

    /// Location new file instances are written to.
    pub location_id: Uuid,

    /// Name of the storage backend used for new file instances.
    pub storage_class: String,

    /// Sum of the distinct file instances referenced by live HEAD versions.
    pub size: i64,

    /// Optional upper bound for `size`.
    pub quota_size: Option<i64>,

    /// Optional upper bound for a single file.
    pub max_file_size: Option<i64>,

    /// Locked buckets reject every mutation.
    pub locked: bool,

    /// Logical tombstone.
    pub deleted: bool,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}
