//! HTTP handlers for objects and multipart uploads.
//!
//! Object bodies are streamed in both directions. S3-style query switches
//! select the operation: `versionId`, `uploads`, `uploadId`, `partNumber`
//! and `tagging`.

use crate::{
    errors::{AppError, FilesError},
    models::{file_instance::FileInstance, object_version::ObjectVersion},
    services::{DEFAULT_RETRY_ATTEMPTS, FilesStore, with_retry},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use std::{collections::BTreeMap, io};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Largest tagging document accepted in a request body.
const MAX_TAGGING_BODY: usize = 64 * 1024;

const VERSION_ID: HeaderName = HeaderName::from_static("x-amz-version-id");
const DELETE_MARKER: HeaderName = HeaderName::from_static("x-amz-delete-marker");

#[derive(Debug, Default, Deserialize)]
pub struct ObjectQuery {
    #[serde(rename = "versionId")]
    pub version_id: Option<Uuid>,
    pub uploads: Option<String>,
    #[serde(rename = "uploadId")]
    pub upload_id: Option<Uuid>,
    #[serde(rename = "partNumber")]
    pub part_number: Option<u64>,
    /// Declared object size when initiating a multipart upload.
    pub size: Option<u64>,
    /// Part size when initiating a multipart upload.
    #[serde(rename = "partSize")]
    pub part_size: Option<u64>,
    pub tagging: Option<String>,
}

/// `PUT /{bucket}/{*key}` stores a new version, uploads one part with
/// `?uploadId&partNumber`, or replaces tags with `?tagging`.
pub async fn put_object(
    State(store): State<FilesStore>,
    Path((bucket_id, key)): Path<(Uuid, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    if q.tagging.is_some() {
        let bytes = axum::body::to_bytes(body, MAX_TAGGING_BODY)
            .await
            .map_err(|err| AppError::bad_request(format!("unreadable tagging body: {}", err)))?;
        let tags: BTreeMap<String, String> = serde_json::from_slice(&bytes)
            .map_err(|err| AppError::bad_request(format!("invalid tagging document: {}", err)))?;
        let version = store.objects.get_object(bucket_id, &key, q.version_id).await?;
        store.objects.set_object_tags(version.version_id, &tags).await?;
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let stream = body.into_data_stream().map(|chunk| chunk.map_err(io::Error::other));

    match (q.upload_id, q.part_number) {
        (Some(upload_id), Some(part_number)) => {
            let upload = store.multipart.get_upload(upload_id).await?;
            if upload.bucket_id != bucket_id || upload.key != key {
                return Err(AppError::bad_request("upload does not belong to this object"));
            }
            let part = store
                .multipart
                .upload_part(upload_id, part_number, stream)
                .await?;
            let mut response = Json(&part).into_response();
            if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", part.checksum)) {
                response.headers_mut().insert(header::ETAG, value);
            }
            Ok(response)
        }
        (Some(_), None) | (None, Some(_)) => Err(AppError::bad_request(
            "uploadId and partNumber must be given together",
        )),
        (None, None) => {
            let size = content_length(&headers);
            let staged = store.objects.stage_object(bucket_id, stream, size).await?;
            let committed = with_retry(DEFAULT_RETRY_ATTEMPTS, || {
                store.objects.commit_staged(bucket_id, &key, &staged)
            })
            .await;
            let version = match committed {
                Ok(version) => version,
                Err(err) => {
                    store.files.discard(&staged).await;
                    return Err(err.into());
                }
            };

            let mut response = Json(&version).into_response();
            set_version_header(response.headers_mut(), &version);
            if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", staged.checksum)) {
                response.headers_mut().insert(header::ETAG, value);
            }
            Ok(response)
        }
    }
}

/// `GET /{bucket}/{*key}` streams the HEAD (or `?versionId`), honouring
/// `Range`. Lists parts with `?uploadId` and tags with `?tagging`.
pub async fn get_object(
    State(store): State<FilesStore>,
    Path((bucket_id, key)): Path<(Uuid, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    if let Some(upload_id) = q.upload_id {
        let parts = store.multipart.list_parts(upload_id).await?;
        return Ok(Json(parts).into_response());
    }

    let version = store.objects.get_object(bucket_id, &key, q.version_id).await?;
    if q.tagging.is_some() {
        let tags = store.objects.get_object_tags(version.version_id).await?;
        return Ok(Json(tags).into_response());
    }

    let range = headers
        .get(header::RANGE)
        .map(|value| {
            value
                .to_str()
                .map_err(|_| AppError::bad_request("Range header is not ASCII"))
        })
        .transpose()?;
    let opened = match store.objects.open_object(version, range).await {
        Ok(opened) => opened,
        Err(err @ FilesError::RangeNotSatisfiable { size }) => {
            let mut response = AppError::from(err).into_response();
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            return Ok(response);
        }
        Err(err) => return Err(err.into()),
    };

    let body = Body::from_stream(ReaderStream::new(opened.reader));
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    set_object_headers(headers, &opened.version, &opened.file, opened.length);
    if let Some(range) = opened.range {
        *response.status_mut() = StatusCode::PARTIAL_CONTENT;
        if let Ok(value) = HeaderValue::from_str(&range.content_range(opened.file.size_bytes())) {
            response.headers_mut().insert(header::CONTENT_RANGE, value);
        }
    }
    Ok(response)
}

/// `HEAD /{bucket}/{*key}`: same headers as GET but no body.
pub async fn head_object(
    State(store): State<FilesStore>,
    Path((bucket_id, key)): Path<(Uuid, String)>,
    Query(q): Query<ObjectQuery>,
) -> Result<Response, AppError> {
    let version = store.objects.get_object(bucket_id, &key, q.version_id).await?;
    let file_id = version
        .file_id
        .ok_or_else(|| AppError::new(StatusCode::NOT_FOUND, "object is a delete marker"))?;
    let file = store.files.get(file_id).await?;

    let mut response = Response::new(Body::empty());
    set_object_headers(response.headers_mut(), &version, &file, file.size_bytes());
    Ok(response)
}

/// `DELETE /{bucket}/{*key}` writes a delete marker. With `?versionId` the
/// version is removed for good; with `?uploadId` the upload is aborted.
pub async fn delete_object(
    State(store): State<FilesStore>,
    Path((bucket_id, key)): Path<(Uuid, String)>,
    Query(q): Query<ObjectQuery>,
) -> Result<Response, AppError> {
    if let Some(upload_id) = q.upload_id {
        store.multipart.abort(upload_id).await?;
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    match q.version_id {
        Some(version_id) => {
            let removed = with_retry(DEFAULT_RETRY_ATTEMPTS, || {
                store.objects.remove_version(bucket_id, &key, version_id)
            })
            .await?;
            set_version_header(response.headers_mut(), &removed);
        }
        None => {
            let marker = with_retry(DEFAULT_RETRY_ATTEMPTS, || {
                store.objects.delete_object(bucket_id, &key)
            })
            .await?;
            set_version_header(response.headers_mut(), &marker);
            response
                .headers_mut()
                .insert(DELETE_MARKER, HeaderValue::from_static("true"));
        }
    }
    Ok(response)
}

/// `POST /{bucket}/{*key}?uploads&size=N[&partSize=M]` starts a multipart
/// upload; `?uploadId` completes one.
pub async fn post_object(
    State(store): State<FilesStore>,
    Path((bucket_id, key)): Path<(Uuid, String)>,
    Query(q): Query<ObjectQuery>,
) -> Result<Response, AppError> {
    if let Some(upload_id) = q.upload_id {
        let upload = store.multipart.get_upload(upload_id).await?;
        if upload.bucket_id != bucket_id || upload.key != key {
            return Err(AppError::bad_request("upload does not belong to this object"));
        }
        let version = store.multipart.complete(upload_id).await?;
        let mut response = Json(&version).into_response();
        set_version_header(response.headers_mut(), &version);
        return Ok(response);
    }

    if q.uploads.is_some() {
        let size = q
            .size
            .ok_or_else(|| AppError::bad_request("size is required to start an upload"))?;
        let settings = store.multipart.settings();
        let part_size = q.part_size.unwrap_or_else(|| {
            size.div_ceil(settings.max_parts)
                .clamp(settings.min_chunk_size, settings.max_chunk_size)
        });
        let upload = store
            .multipart
            .initiate(bucket_id, &key, size, part_size)
            .await?;
        return Ok((StatusCode::CREATED, Json(upload)).into_response());
    }

    Err(AppError::bad_request("expected ?uploads or ?uploadId"))
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn set_version_header(headers: &mut HeaderMap, version: &ObjectVersion) {
    if let Ok(value) = HeaderValue::from_str(&version.version_id.to_string()) {
        headers.insert(VERSION_ID, value);
    }
}

fn set_object_headers(
    headers: &mut HeaderMap,
    version: &ObjectVersion,
    file: &FileInstance,
    length: u64,
) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    if let Some(checksum) = file.checksum.as_ref() {
        let quoted = format!("\"{}\"", checksum);
        if let Ok(value) = HeaderValue::from_str(&quoted) {
            headers.insert(header::ETAG, value);
        }
    }

    headers.insert(
        header::LAST_MODIFIED,
        HeaderValue::from_str(&version.created_at.to_rfc2822())
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    set_version_header(headers, version);
}
