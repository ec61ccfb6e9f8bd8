//! Represents physical bytes stored by a backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub(crate) const FILE_COLUMNS: &str = "id, uri, backend, size, checksum, readable, writable, \
     last_check, last_check_at, created_at, updated_at";

/// Content-addressed blob descriptor.
///
/// Several object versions may point at the same file instance; a file is
/// live as long as any version references it. Once finalized (`writable =
/// false`) only `readable`, `last_check` and `last_check_at` change.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct FileInstance {
    pub id: Uuid,

    /// Backend-specific location of the bytes.
    pub uri: String,

    /// Registry name of the backend holding the bytes.
    pub backend: String,

    pub size: i64,

    /// `<algorithm>:<hex>`; absent while a multipart upload is in progress.
    pub checksum: Option<String>,

    pub readable: bool,

    pub writable: bool,

    /// Outcome of the last verification: passed, failed, or unknown.
    pub last_check: Option<bool>,

    pub last_check_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl FileInstance {
    pub fn size_bytes(&self) -> u64 {
        self.size.max(0) as u64
    }
}
