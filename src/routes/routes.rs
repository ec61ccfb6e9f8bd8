//! Routes for the versioned file store.
//!
//! ## Structure
//! - **Administration**
//!   - `GET|POST /locations`  list or create locations
//!   - `GET|POST /buckets`    list or create buckets
//!   - `GET|POST /files/{id}` inspect a file, `?verify` or `?migrate=<location>`
//!
//! - **Bucket-level endpoints** (buckets are addressed by id)
//!   - `GET    /{bucket}`  list objects (`?versions`, `?uploads` switch listings)
//!   - `HEAD   /{bucket}`  bucket size and quota
//!   - `POST   /{bucket}`  `?sync`, `?snapshot` or `?locked=<bool>`
//!   - `DELETE /{bucket}`  remove, or `?purge` a removed bucket
//!
//! - **Object-level endpoints**
//!   - `PUT    /{bucket}/{*key}`  upload an object or a part
//!   - `GET    /{bucket}/{*key}`  download (supports `Range`)
//!   - `HEAD   /{bucket}/{*key}`  metadata only
//!   - `DELETE /{bucket}/{*key}`  delete marker, version removal or abort
//!   - `POST   /{bucket}/{*key}`  initiate or complete a multipart upload
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        bucket_handlers::{
            bucket_action, create_bucket, create_location, delete_bucket, head_bucket,
            list_buckets, list_locations, list_objects,
        },
        file_handlers::{file_action, get_file},
        health_handlers::{healthz, readyz},
        object_handlers::{delete_object, get_object, head_object, post_object, put_object},
    },
    services::FilesStore,
};
use axum::{
    Router,
    routing::{get, put},
};

/// Build the router. Every handler shares the [`FilesStore`] state.
pub fn routes() -> Router<FilesStore> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/locations", get(list_locations).post(create_location))
        .route("/buckets", get(list_buckets).post(create_bucket))
        .route("/files/{id}", get(get_file).post(file_action))
        // Object-level routes
        .route(
            "/{bucket}/{*key}",
            put(put_object)
                .get(get_object)
                .head(head_object)
                .delete(delete_object)
                .post(post_object),
        )
        // Bucket-level routes
        .route(
            "/{bucket}",
            get(list_objects)
                .head(head_bucket)
                .post(bucket_action)
                .delete(delete_bucket),
        )
}
