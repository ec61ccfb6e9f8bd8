//! File instance inspection and background maintenance requests.

use crate::{
    errors::AppError,
    models::file_instance::FileInstance,
    services::{
        FilesStore,
        files::VerifyOptions,
        jobs::MigrateOptions,
        tasks::{QueueError, Task},
    },
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use uuid::Uuid;

#[derive(Debug, Default, Deserialize)]
pub struct FileActionQuery {
    pub verify: Option<String>,
    #[serde(default)]
    pub pessimistic: bool,
    /// Target location name.
    pub migrate: Option<String>,
    /// Target backend for a migration.
    pub backend: Option<String>,
    #[serde(default)]
    pub fixity: bool,
    #[serde(default)]
    pub remove_source: bool,
}

/// `GET /files/{id}`
pub async fn get_file(
    State(store): State<FilesStore>,
    Path(file_id): Path<Uuid>,
) -> Result<Json<FileInstance>, AppError> {
    Ok(Json(store.files.get(file_id).await?))
}

/// `POST /files/{id}?verify` or `?migrate=<location>`.
///
/// Requests are queued when background jobs run. A verification runs inline
/// otherwise; a migration needs the queue.
pub async fn file_action(
    State(store): State<FilesStore>,
    Path(file_id): Path<Uuid>,
    Query(q): Query<FileActionQuery>,
) -> Result<Response, AppError> {
    store.files.get(file_id).await?;

    let task = if q.verify.is_some() {
        Task::VerifyChecksum {
            file_id,
            pessimistic: q.pessimistic,
        }
    } else if let Some(location) = q.migrate {
        store.objects.get_location(&location).await?;
        Task::MigrateFile {
            file_id,
            location,
            options: MigrateOptions {
                post_fixity_check: q.fixity,
                remove_source: q.remove_source,
                backend: q.backend,
            },
        }
    } else {
        return Err(AppError::bad_request("expected ?verify or ?migrate=<location>"));
    };

    let Some(queue) = store.tasks.as_ref() else {
        return match task {
            Task::VerifyChecksum { pessimistic, .. } => {
                let check = store
                    .files
                    .verify_checksum(
                        file_id,
                        VerifyOptions {
                            pessimistic,
                            ..VerifyOptions::default()
                        },
                    )
                    .await?;
                Ok(Json(check).into_response())
            }
            _ => Err(AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "background jobs are disabled",
            )),
        };
    };

    match queue.try_enqueue(task) {
        Ok(()) => Ok(StatusCode::ACCEPTED.into_response()),
        Err(QueueError::Full) => Err(AppError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "task queue is full, retry later",
        )),
        Err(QueueError::Closed) => Err(AppError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "task queue is closed",
        )),
    }
}
