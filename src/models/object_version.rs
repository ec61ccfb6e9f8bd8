//! Represents one version of a key stored in a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub(crate) const VERSION_COLUMNS: &str =
    "bucket_id, key, version_id, file_id, is_head, created_at, updated_at";

/// A single immutable snapshot of a key.
///
/// `file_id` is `None` for delete markers. For each (bucket, key) at most one
/// version has `is_head` set.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct ObjectVersion {
    /// Foreign key linking to the parent bucket.
    pub bucket_id: Uuid,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    pub version_id: Uuid,

    /// Referenced file instance, or `None` for a delete marker.
    pub file_id: Option<Uuid>,

    /// Whether this is the most recent version of the key.
    pub is_head: bool,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl ObjectVersion {
    pub fn is_delete_marker(&self) -> bool {
        self.file_id.is_none()
    }
}
