//! Key-value tags attached to object versions and buckets.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Tag attached to one object version.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct ObjectVersionTag {
    pub version_id: Uuid,
    pub key: String,
    pub value: String,
}

/// Tag attached to a bucket.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct BucketTag {
    pub bucket_id: Uuid,
    pub key: String,
    pub value: String,
}
