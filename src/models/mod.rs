//! Core data models for the versioned file store.
//!
//! These entities represent locations, buckets, object versions, file
//! instances and multipart staging records. They map cleanly to database
//! tables via `sqlx::FromRow` and serialize naturally as JSON via `serde`.

pub mod bucket;
pub mod file_instance;
pub mod location;
pub mod multipart;
pub mod object_version;
pub mod tag;
