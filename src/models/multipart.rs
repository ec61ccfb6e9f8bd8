//! Represents multipart upload sessions and parts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub(crate) const UPLOAD_COLUMNS: &str =
    "upload_id, bucket_id, key, file_id, size, chunk_size, completed, created_at, updated_at";

pub(crate) const PART_COLUMNS: &str =
    "upload_id, part_number, byte_offset, size, checksum, created_at";

/// A multipart upload session.
///
/// Space for the whole object is reserved in `file_id` when the session
/// starts; part `n` is written at `n * chunk_size`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct MultipartUpload {
    /// Unique upload ID (returned to client).
    pub upload_id: Uuid,

    /// Parent bucket ID.
    pub bucket_id: Uuid,

    /// Object key being uploaded.
    pub key: String,

    /// Reserved file instance receiving the parts.
    pub file_id: Uuid,

    /// Declared total size in bytes.
    pub size: i64,

    /// Size of every part except possibly the last.
    pub chunk_size: i64,

    /// Whether upload has been merged into an object version.
    pub completed: bool,

    /// Timestamp when upload was initiated.
    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl MultipartUpload {
    /// Number of parts the declared size splits into.
    pub fn part_count(&self) -> u64 {
        let size = self.size.max(0) as u64;
        let chunk = self.chunk_size.max(1) as u64;
        size.div_ceil(chunk)
    }

    /// Index of the final part.
    pub fn last_part_number(&self) -> u64 {
        self.part_count().saturating_sub(1)
    }

    /// Size of the final part.
    pub fn last_part_size(&self) -> u64 {
        let size = self.size.max(0) as u64;
        let chunk = self.chunk_size.max(1) as u64;
        size - chunk * self.last_part_number()
    }

    /// Expected `(offset, size)` of a part, or `None` for an out-of-range number.
    pub fn part_layout(&self, part_number: u64) -> Option<(u64, u64)> {
        if part_number >= self.part_count() {
            return None;
        }
        let chunk = self.chunk_size as u64;
        let size = if part_number == self.last_part_number() {
            self.last_part_size()
        } else {
            chunk
        };
        Some((part_number * chunk, size))
    }
}

/// Represents a single uploaded part in a multipart upload session.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct MultipartPart {
    /// Reference to parent upload session.
    pub upload_id: Uuid,

    /// Part number (0-based).
    pub part_number: i64,

    /// Byte offset of the part inside the reserved file.
    pub byte_offset: i64,

    /// Size in bytes.
    pub size: i64,

    /// Checksum of the part's bytes.
    pub checksum: String,

    /// Timestamp when this part was uploaded.
    pub created_at: DateTime<Utc>,
}
