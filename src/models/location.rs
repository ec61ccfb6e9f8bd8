//! Represents a physical storage root.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub(crate) const LOCATION_COLUMNS: &str = "id, name, uri, is_default, created_at";

/// A named physical storage root (a directory tree, a remote bucket, ...).
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Location {
    pub id: Uuid,

    /// Slug name, unique across locations.
    pub name: String,

    /// Root URI handed to backend factories when laying out new files.
    pub uri: String,

    /// At most one location is the default at any time.
    pub is_default: bool,

    pub created_at: DateTime<Utc>,
}
