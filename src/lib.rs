//! Versioned, content-addressed file storage.
//!
//! Buckets hold versioned objects; every object version points at a
//! [`models::file_instance::FileInstance`] describing physical bytes kept by a
//! pluggable [`storage::StorageBackend`]. Metadata lives in SQLite and is only
//! mutated inside short transactions; background jobs in
//! [`services::jobs`] keep the physical layer consistent with it.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;
