//! Task queue for background work.
//!
//! Producers enqueue [`Task`]s on a bounded channel; a [`WorkerPool`] drains
//! it with a fixed number of workers. The [`Scheduler`] is just another
//! producer that enqueues the periodic jobs on tokio intervals, so jobs can be
//! exercised without it.

use crate::{
    errors::FilesResult,
    models::file_instance::FileInstance,
    services::{
        files::{FileCheck, FileRegistry, VerifyOptions},
        jobs::{
            ChecksumVerifier, MigrateOptions, Migrator, OrphanCleaner, OrphanReport,
            VerificationBatch, VerificationReport,
        },
        multipart::{ExpiryReport, MultipartService},
    },
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    VerifyChecksum { file_id: Uuid, pessimistic: bool },
    ScheduleChecksumVerification(VerificationBatch),
    MigrateFile {
        file_id: Uuid,
        location: String,
        options: MigrateOptions,
    },
    RemoveFileData { file_id: Uuid },
    ClearOrphanedFiles { limit: u64 },
    RemoveExpiredUploads { ttl: chrono::Duration },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Self::VerifyChecksum { .. } => "verify_checksum",
            Self::ScheduleChecksumVerification(_) => "schedule_checksum_verification",
            Self::MigrateFile { .. } => "migrate_file",
            Self::RemoveFileData { .. } => "remove_file_data",
            Self::ClearOrphanedFiles { .. } => "clear_orphaned_files",
            Self::RemoveExpiredUploads { .. } => "remove_expired_uploads",
        }
    }
}

#[derive(Debug, Clone)]
pub enum TaskOutcome {
    FileChecked(FileCheck),
    Verification(VerificationReport),
    Migrated(FileInstance),
    FileRemoved(bool),
    Orphans(OrphanReport),
    Expired(ExpiryReport),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("task queue is full")]
    Full,
    #[error("task queue is closed")]
    Closed,
}

/// Producer handle. Cloning it adds a producer; the workers stop once every
/// handle is dropped and the queue is drained.
#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::Sender<Task>,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Task>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Wait for room in the queue.
    pub async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        debug!(task = task.name(), "enqueue");
        self.sender.send(task).await.map_err(|_| QueueError::Closed)
    }

    /// Enqueue without waiting.
    pub fn try_enqueue(&self, task: Task) -> Result<(), QueueError> {
        self.sender.try_send(task).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }
}

/// Executes tasks against the services.
#[derive(Clone)]
pub struct TaskRunner {
    files: FileRegistry,
    verifier: ChecksumVerifier,
    cleaner: OrphanCleaner,
    migrator: Migrator,
    multipart: MultipartService,
}

impl TaskRunner {
    pub fn new(
        files: FileRegistry,
        verifier: ChecksumVerifier,
        cleaner: OrphanCleaner,
        migrator: Migrator,
        multipart: MultipartService,
    ) -> Self {
        Self {
            files,
            verifier,
            cleaner,
            migrator,
            multipart,
        }
    }

    pub async fn run(&self, task: Task) -> FilesResult<TaskOutcome> {
        let outcome = match task {
            Task::VerifyChecksum {
                file_id,
                pessimistic,
            } => TaskOutcome::FileChecked(
                self.files
                    .verify_checksum(
                        file_id,
                        VerifyOptions {
                            pessimistic,
                            throws: false,
                            ..VerifyOptions::default()
                        },
                    )
                    .await?,
            ),
            Task::ScheduleChecksumVerification(batch) => {
                TaskOutcome::Verification(self.verifier.run_batch(batch).await?)
            }
            Task::MigrateFile {
                file_id,
                location,
                options,
            } => TaskOutcome::Migrated(
                self.migrator
                    .migrate_file(file_id, &location, &options)
                    .await?,
            ),
            Task::RemoveFileData { file_id } => {
                TaskOutcome::FileRemoved(self.files.remove_file_data(file_id).await?)
            }
            Task::ClearOrphanedFiles { limit } => {
                TaskOutcome::Orphans(self.cleaner.run(limit).await?)
            }
            Task::RemoveExpiredUploads { ttl } => {
                TaskOutcome::Expired(self.multipart.remove_expired(ttl).await?)
            }
        };
        Ok(outcome)
    }
}

/// Fixed set of workers sharing one receiver.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(runner: TaskRunner, receiver: mpsc::Receiver<Task>, workers: usize) -> Self {
        let receiver = Arc::new(Mutex::new(receiver));
        let runner = Arc::new(runner);
        let handles = (0..workers.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let runner = runner.clone();
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(task) = next else {
                            break;
                        };
                        let name = task.name();
                        match runner.run(task).await {
                            Ok(outcome) => debug!(worker, task = name, ?outcome, "task finished"),
                            Err(err) => warn!(worker, task = name, error = %err, "task failed"),
                        }
                    }
                    debug!(worker, "worker stopped");
                })
            })
            .collect();
        Self { handles }
    }

    /// Wait for every worker to drain the queue and stop.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(error = %err, "worker panicked");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub verification: VerificationBatch,
    pub orphan_limit: u64,
    pub orphan_interval: Duration,
    pub upload_ttl: chrono::Duration,
    pub expiry_interval: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            verification: VerificationBatch::default(),
            orphan_limit: 1000,
            orphan_interval: Duration::from_secs(24 * 3600),
            upload_ttl: chrono::Duration::days(1),
            expiry_interval: Duration::from_secs(3600),
        }
    }
}

/// Enqueues the periodic jobs.
pub struct Scheduler {
    queue: TaskQueue,
    settings: JobSettings,
}

impl Scheduler {
    pub fn new(queue: TaskQueue, settings: JobSettings) -> Self {
        Self { queue, settings }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        let mut verify = interval(self.settings.verification.batch_interval);
        let mut orphans = interval(self.settings.orphan_interval);
        let mut expiry = interval(self.settings.expiry_interval);
        for ticker in [&mut verify, &mut orphans, &mut expiry] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }
        info!(settings = ?self.settings, "scheduler started");

        loop {
            let task = tokio::select! {
                _ = verify.tick() => Task::ScheduleChecksumVerification(self.settings.verification),
                _ = orphans.tick() => Task::ClearOrphanedFiles { limit: self.settings.orphan_limit },
                _ = expiry.tick() => Task::RemoveExpiredUploads { ttl: self.settings.upload_ttl },
            };
            match self.queue.try_enqueue(task) {
                Ok(()) => {}
                Err(QueueError::Full) => warn!("task queue full; periodic task deferred"),
                Err(QueueError::Closed) => {
                    info!("task queue closed; scheduler stopping");
                    break;
                }
            }
        }
    }
}
