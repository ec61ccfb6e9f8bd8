//! Storage engine services and the state shared with the HTTP layer.

pub mod events;
pub mod files;
pub mod jobs;
pub mod multipart;
pub mod objects;
pub mod range;
pub mod tasks;

use crate::{errors::FilesResult, storage::BackendRegistry};
use events::EventBus;
use files::FileRegistry;
use multipart::{MultipartService, MultipartSettings};
use objects::ObjectService;
use sqlx::SqlitePool;
use std::{future::Future, path::PathBuf, sync::Arc};
use tasks::TaskQueue;
use tracing::warn;

/// Attempts callers make before giving up on an integrity conflict.
pub const DEFAULT_RETRY_ATTEMPTS: usize = 3;

/// Run `op` until it succeeds, fails with anything other than an integrity
/// conflict, or `attempts` runs are used up.
pub async fn with_retry<T, F, Fut>(attempts: usize, mut op: F) -> FilesResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = FilesResult<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_conflict() && attempt < attempts => {
                warn!(attempt, error = %err, "integrity conflict; retrying");
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Every service wired to one database and backend registry.
#[derive(Clone)]
pub struct FilesStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,
    pub backends: Arc<BackendRegistry>,
    pub events: EventBus,
    pub files: FileRegistry,
    pub objects: ObjectService,
    pub multipart: MultipartService,
    /// Queue for background work; absent when jobs are disabled.
    pub tasks: Option<TaskQueue>,
    /// Directory probed by the readiness check.
    pub base_path: PathBuf,
}

impl FilesStore {
    pub fn new(
        db: Arc<SqlitePool>,
        backends: Arc<BackendRegistry>,
        multipart: MultipartSettings,
        base_path: impl Into<PathBuf>,
    ) -> Self {
        let events = EventBus::new();
        let files = FileRegistry::new(db.clone(), backends.clone(), events.clone());
        let objects = ObjectService::new(db.clone(), files.clone(), events.clone());
        let multipart = MultipartService::new(db.clone(), files.clone(), events.clone(), multipart);
        Self {
            db,
            backends,
            events,
            files,
            objects,
            multipart,
            tasks: None,
            base_path: base_path.into(),
        }
    }

    pub fn with_tasks(mut self, queue: TaskQueue) -> Self {
        self.tasks = Some(queue);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FilesError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retries_only_integrity_conflicts() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result = with_retry(3, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(FilesError::IntegrityConflict("raced".into()))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);

        calls.store(0, Ordering::SeqCst);
        let result: FilesResult<()> = with_retry(3, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FilesError::InvalidKey("bad".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        calls.store(0, Ordering::SeqCst);
        let result: FilesResult<()> = with_retry(2, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FilesError::IntegrityConflict("raced".into()))
        })
        .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
