//! HTTP handlers for locations and buckets.
//!
//! Buckets are addressed by id. Bodies are JSON; listing pages carry an
//! opaque base64 continuation token.

use crate::{
    errors::AppError,
    models::{bucket::Bucket, location::Location},
    services::{
        FilesStore,
        objects::{CreateBucket, ListObjectsParams, ObjectSummary, SyncDiscrepancy},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CreateLocationReq {
    pub name: String,
    pub uri: String,
    #[serde(default)]
    pub default: bool,
}

/// Request body for `POST /buckets`. Every field is optional.
#[derive(Debug, Default, Deserialize)]
pub struct CreateBucketReq {
    pub location: Option<String>,
    pub storage_class: Option<String>,
    pub quota_size: Option<u64>,
    pub max_file_size: Option<u64>,
}

/// Query params accepted by `GET /{bucket}`.
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    #[serde(rename = "max-keys")]
    pub max_keys: Option<usize>,
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
    #[serde(rename = "start-after")]
    pub start_after: Option<String>,
    /// Present to list every version instead of live objects.
    pub versions: Option<String>,
    /// Present to list unfinished multipart uploads.
    pub uploads: Option<String>,
}

/// Query switches accepted by `POST /{bucket}`.
#[derive(Debug, Default, Deserialize)]
pub struct BucketActionQuery {
    pub sync: Option<String>,
    pub snapshot: Option<String>,
    pub locked: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteBucketQuery {
    /// Present to drop an already removed bucket and its versions.
    pub purge: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListObjectsResponse {
    pub bucket: Uuid,
    pub prefix: Option<String>,
    pub delimiter: Option<String>,
    pub max_keys: usize,
    pub key_count: usize,
    pub is_truncated: bool,
    pub continuation_token: Option<String>,
    pub next_continuation_token: Option<String>,
    pub contents: Vec<ObjectSummary>,
    pub common_prefixes: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub bucket: Bucket,
    pub discrepancies: Vec<SyncDiscrepancy>,
}

/// `GET /locations`
pub async fn list_locations(
    State(store): State<FilesStore>,
) -> Result<Json<Vec<Location>>, AppError> {
    Ok(Json(store.objects.list_locations().await?))
}

/// `POST /locations`
pub async fn create_location(
    State(store): State<FilesStore>,
    Json(req): Json<CreateLocationReq>,
) -> Result<impl IntoResponse, AppError> {
    let location = store
        .objects
        .create_location(&req.name, &req.uri, req.default)
        .await?;
    Ok((StatusCode::CREATED, Json(location)))
}

/// `GET /buckets`
pub async fn list_buckets(State(store): State<FilesStore>) -> Result<Json<Vec<Bucket>>, AppError> {
    Ok(Json(store.objects.list_buckets().await?))
}

/// `POST /buckets`
pub async fn create_bucket(
    State(store): State<FilesStore>,
    payload: Option<Json<CreateBucketReq>>,
) -> Result<impl IntoResponse, AppError> {
    let req = payload.map(|Json(req)| req).unwrap_or_default();
    let bucket = store
        .objects
        .create_bucket(CreateBucket {
            location: req.location,
            storage_class: req.storage_class,
            quota_size: req.quota_size,
            max_file_size: req.max_file_size,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(bucket)))
}

/// `GET /{bucket}` lists live objects, or versions with `?versions`, or
/// unfinished uploads with `?uploads`.
pub async fn list_objects(
    State(store): State<FilesStore>,
    Path(bucket_id): Path<Uuid>,
    Query(q): Query<ListQuery>,
) -> Result<Response, AppError> {
    if q.versions.is_some() {
        let versions = store
            .objects
            .list_versions(bucket_id, q.prefix.as_deref())
            .await?;
        return Ok(Json(versions).into_response());
    }
    if q.uploads.is_some() {
        store.objects.get_bucket(bucket_id).await?;
        let uploads = store.multipart.list_uploads(bucket_id).await?;
        return Ok(Json(uploads).into_response());
    }

    let continuation_token = q
        .continuation_token
        .as_deref()
        .map(decode_continuation_token)
        .transpose()?;
    let max_keys = q.max_keys.unwrap_or(1000).clamp(1, 1000);
    let params = ListObjectsParams {
        prefix: q.prefix.clone(),
        delimiter: q.delimiter.clone(),
        continuation_token,
        start_after: q.start_after.clone(),
        max_keys,
    };

    let result = store.objects.list_objects(bucket_id, params).await?;
    Ok(Json(ListObjectsResponse {
        bucket: bucket_id,
        prefix: q.prefix,
        delimiter: q.delimiter,
        max_keys,
        key_count: result.key_count,
        is_truncated: result.is_truncated,
        continuation_token: q.continuation_token,
        next_continuation_token: result
            .next_continuation_token
            .as_deref()
            .map(encode_continuation_token),
        contents: result.objects,
        common_prefixes: result.common_prefixes,
    })
    .into_response())
}

/// `HEAD /{bucket}`
pub async fn head_bucket(
    State(store): State<FilesStore>,
    Path(bucket_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let bucket = store.objects.get_bucket(bucket_id).await?;
    let mut response = Response::new(Body::empty());
    let headers = response.headers_mut();
    headers.insert("x-files-bucket-size", HeaderValue::from(bucket.size));
    if let Some(quota) = bucket.quota_size {
        headers.insert("x-files-bucket-quota", HeaderValue::from(quota));
    }
    if let Ok(value) = HeaderValue::from_str(&bucket.storage_class) {
        headers.insert("x-files-storage-class", value);
    }
    headers.insert(
        header::LAST_MODIFIED,
        HeaderValue::from_str(&bucket.updated_at.to_rfc2822())
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    Ok(response)
}

/// `DELETE /{bucket}` marks the bucket removed; `?purge` then drops it.
pub async fn delete_bucket(
    State(store): State<FilesStore>,
    Path(bucket_id): Path<Uuid>,
    Query(q): Query<DeleteBucketQuery>,
) -> Result<impl IntoResponse, AppError> {
    if q.purge.is_some() {
        let versions = store.objects.purge_bucket(bucket_id).await?;
        tracing::info!(%bucket_id, versions, "bucket purged over http");
    } else {
        store.objects.remove_bucket(bucket_id).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /{bucket}?sync`, `?snapshot` or `?locked=<bool>`.
pub async fn bucket_action(
    State(store): State<FilesStore>,
    Path(bucket_id): Path<Uuid>,
    Query(q): Query<BucketActionQuery>,
) -> Result<Response, AppError> {
    if q.sync.is_some() {
        let (bucket, discrepancies) = store.objects.sync_bucket(bucket_id).await?;
        return Ok(Json(SyncResponse {
            bucket,
            discrepancies,
        })
        .into_response());
    }
    if q.snapshot.is_some() {
        let snapshot = store.objects.snapshot_bucket(bucket_id).await?;
        return Ok((StatusCode::CREATED, Json(snapshot)).into_response());
    }
    if let Some(locked) = q.locked {
        let bucket = store.objects.set_locked(bucket_id, locked).await?;
        return Ok(Json(bucket).into_response());
    }
    Err(AppError::bad_request(
        "expected one of ?sync, ?snapshot or ?locked=<bool>",
    ))
}

fn encode_continuation_token(token: &str) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(token)
}

fn decode_continuation_token(token: &str) -> Result<String, AppError> {
    general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| AppError::bad_request("malformed continuation token"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_tokens_are_opaque_and_checked() {
        let token = encode_continuation_token("photos/2025/img.jpg");
        assert!(!token.contains('/'));
        assert_eq!(
            decode_continuation_token(&token).unwrap(),
            "photos/2025/img.jpg"
        );
        let err = decode_continuation_token("not base64!").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
