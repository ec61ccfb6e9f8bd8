//! Background consistency jobs.
//!
//! Each job works in bounded batches and commits per item, so an interrupted
//! run leaves metadata valid and the next run picks up the remainder.

use crate::{
    errors::{FilesError, FilesResult},
    models::file_instance::{FILE_COLUMNS, FileInstance},
    services::{
        files::{CheckOutcome, FileRegistry, StagedFile, VerifyOptions},
        objects::ObjectService,
    },
    storage::{ChecksumAlgorithm, DEFAULT_CHUNK_SIZE, fs::sweep_staging, hash_reader},
};
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::SqlitePool;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounds for one checksum verification run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VerificationBatch {
    /// Every file should be checked at least once per `frequency`.
    pub frequency: Duration,
    /// Time between two runs.
    pub batch_interval: Duration,
    /// Maximum files per run. `Some(0)` derives the share of one run from
    /// `frequency / batch_interval`.
    pub max_count: Option<u64>,
    /// Maximum bytes per run, derived the same way for `Some(0)`.
    pub max_size: Option<u64>,
    /// Stop issuing checks after this much wall time.
    pub time_budget: Option<Duration>,
    /// Also re-check files already marked unreadable.
    pub pessimistic: bool,
    pub chunk_size: usize,
}

impl Default for VerificationBatch {
    fn default() -> Self {
        Self {
            frequency: Duration::from_secs(30 * 24 * 3600),
            batch_interval: Duration::from_secs(3600),
            max_count: Some(0),
            max_size: Some(0),
            time_budget: None,
            pessimistic: false,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl VerificationBatch {
    /// Number of runs sharing one `frequency` window.
    fn runs_per_cycle(&self) -> f64 {
        let interval = self.batch_interval.as_secs_f64();
        if interval <= 0.0 {
            return 1.0;
        }
        (self.frequency.as_secs_f64() / interval).max(1.0)
    }

    fn resolve(&self, limit: Option<u64>, total: u64) -> Option<u64> {
        match limit {
            Some(0) => Some((total as f64 / self.runs_per_cycle()).ceil() as u64),
            other => other,
        }
    }
}

/// Which bound ended a verification run early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchBound {
    Size,
    Time,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub checked: u64,
    pub passed: u64,
    pub failed: u64,
    pub unavailable: u64,
    pub skipped: u64,
    pub errors: u64,
    pub bytes: u64,
    pub stopped_by: Option<BatchBound>,
}

#[derive(Clone)]
pub struct ChecksumVerifier {
    db: Arc<SqlitePool>,
    files: FileRegistry,
}

impl ChecksumVerifier {
    pub fn new(db: Arc<SqlitePool>, files: FileRegistry) -> Self {
        Self { db, files }
    }

    /// Verify the files that went longest without a check, within `batch`.
    pub async fn run_batch(&self, batch: VerificationBatch) -> FilesResult<VerificationReport> {
        let started = Instant::now();
        let (total_count, total_size): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM file_instances
             WHERE writable = 0 AND (readable = 1 OR ?)",
        )
        .bind(batch.pessimistic)
        .fetch_one(&*self.db)
        .await?;

        let max_count = batch.resolve(batch.max_count, total_count.max(0) as u64);
        let max_size = batch.resolve(batch.max_size, total_size.max(0) as u64);

        let candidates: Vec<(Uuid, i64)> = sqlx::query_as(
            "SELECT id, size FROM file_instances
             WHERE writable = 0 AND (readable = 1 OR ?)
             ORDER BY last_check_at IS NOT NULL, last_check_at ASC, id ASC
             LIMIT ?",
        )
        .bind(batch.pessimistic)
        .bind(max_count.map_or(-1, |count| count as i64))
        .fetch_all(&*self.db)
        .await?;

        let opts = VerifyOptions {
            pessimistic: batch.pessimistic,
            throws: false,
            chunk_size: batch.chunk_size,
        };
        let mut report = VerificationReport::default();
        for (file_id, size) in candidates {
            let size = size.max(0) as u64;
            if let Some(limit) = max_size {
                if report.checked > 0 && report.bytes + size > limit {
                    report.stopped_by = Some(BatchBound::Size);
                    break;
                }
            }
            if let Some(budget) = batch.time_budget {
                if report.checked > 0 && started.elapsed() >= budget {
                    report.stopped_by = Some(BatchBound::Time);
                    break;
                }
            }

            report.checked += 1;
            report.bytes += size;
            match self.files.verify_checksum(file_id, opts).await {
                Ok(check) => match check.outcome {
                    CheckOutcome::Passed => report.passed += 1,
                    CheckOutcome::Failed => report.failed += 1,
                    CheckOutcome::Unavailable => report.unavailable += 1,
                    CheckOutcome::Skipped => report.skipped += 1,
                },
                Err(err) => {
                    warn!(%file_id, error = %err, "verification errored");
                    report.errors += 1;
                }
            }
        }

        info!(
            checked = report.checked,
            failed = report.failed,
            bytes = report.bytes,
            stopped_by = ?report.stopped_by,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "checksum verification batch finished"
        );
        Ok(report)
    }
}

/// Predicate returning `true` for files that must be kept, e.g. under legal hold.
pub type OrphanVeto = Arc<dyn Fn(&FileInstance) -> bool + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrphanReport {
    pub scanned: u64,
    pub removed: u64,
    pub vetoed: u64,
    /// Re-referenced between the scan and the delete.
    pub kept: u64,
    pub failed: u64,
    pub freed_bytes: u64,
    /// Abandoned `.tmp-*` staging files deleted from location roots.
    pub stale_staging: u64,
}

/// Removes file instances no version or open upload refers to.
///
/// Scans resume where the previous run stopped and wrap around at the end of
/// the table. Each pass that starts from the beginning also sweeps staging
/// files older than the grace period out of every location root.
#[derive(Clone)]
pub struct OrphanCleaner {
    db: Arc<SqlitePool>,
    files: FileRegistry,
    veto: Option<OrphanVeto>,
    cursor: Arc<Mutex<Option<Uuid>>>,
    staging_grace: Duration,
}

impl OrphanCleaner {
    pub fn new(db: Arc<SqlitePool>, files: FileRegistry) -> Self {
        Self {
            db,
            files,
            veto: None,
            cursor: Arc::new(Mutex::new(None)),
            staging_grace: Duration::from_secs(3600),
        }
    }

    pub fn with_veto(mut self, veto: OrphanVeto) -> Self {
        self.veto = Some(veto);
        self
    }

    /// Minimum age before a staging file counts as abandoned.
    pub fn with_staging_grace(mut self, grace: Duration) -> Self {
        self.staging_grace = grace;
        self
    }

    /// Examine at most `limit` orphans.
    pub async fn run(&self, limit: u64) -> FilesResult<OrphanReport> {
        let cursor = *self.cursor.lock();
        let after = cursor.unwrap_or(Uuid::nil());
        let orphans = sqlx::query_as::<_, FileInstance>(&format!(
            "SELECT {FILE_COLUMNS} FROM file_instances f
             WHERE f.id > ?
               AND NOT EXISTS (SELECT 1 FROM object_versions v WHERE v.file_id = f.id)
               AND NOT EXISTS (
                   SELECT 1 FROM multipart_uploads m WHERE m.file_id = f.id AND m.completed = 0
               )
             ORDER BY f.id ASC
             LIMIT ?"
        ))
        .bind(after)
        .bind(limit.max(1) as i64)
        .fetch_all(&*self.db)
        .await?;

        let next_cursor = if (orphans.len() as u64) < limit.max(1) {
            None
        } else {
            orphans.last().map(|file| file.id)
        };

        let mut report = OrphanReport::default();
        if cursor.is_none() {
            report.stale_staging = self.sweep_locations().await?;
        }
        for file in orphans {
            report.scanned += 1;
            if self.veto.as_ref().is_some_and(|veto| veto(&file)) {
                debug!(file_id = %file.id, "orphan removal vetoed");
                report.vetoed += 1;
                continue;
            }
            match self.files.remove_file_data(file.id).await {
                Ok(true) => {
                    report.removed += 1;
                    report.freed_bytes += file.size_bytes();
                }
                Ok(false) => report.kept += 1,
                Err(err) => {
                    warn!(file_id = %file.id, error = %err, "failed to remove orphaned file");
                    report.failed += 1;
                }
            }
        }
        *self.cursor.lock() = next_cursor;

        if report.scanned > 0 || report.stale_staging > 0 {
            info!(
                scanned = report.scanned,
                removed = report.removed,
                vetoed = report.vetoed,
                freed_bytes = report.freed_bytes,
                stale_staging = report.stale_staging,
                "orphan cleanup finished"
            );
        }
        Ok(report)
    }

    async fn sweep_locations(&self) -> FilesResult<u64> {
        let roots: Vec<String> = sqlx::query_scalar("SELECT uri FROM locations")
            .fetch_all(&*self.db)
            .await?;
        let mut swept = 0;
        for root in roots {
            match sweep_staging(&root, self.staging_grace).await {
                Ok(count) => swept += count,
                Err(err) => warn!(location = %root, error = %err, "staging sweep failed"),
            }
        }
        Ok(swept)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrateOptions {
    /// Verify the new copy after the relink commits.
    pub post_fixity_check: bool,
    /// Delete the source once nothing references it.
    pub remove_source: bool,
    /// Target backend; the source's backend when absent.
    pub backend: Option<String>,
}

/// Moves file instances between locations.
#[derive(Clone)]
pub struct Migrator {
    db: Arc<SqlitePool>,
    files: FileRegistry,
    objects: ObjectService,
}

impl Migrator {
    pub fn new(db: Arc<SqlitePool>, files: FileRegistry, objects: ObjectService) -> Self {
        Self { db, files, objects }
    }

    /// Copy `file_id` to `location`, check the copy, then point every version
    /// at it in one transaction. The source bytes are only touched after that
    /// transaction committed.
    pub async fn migrate_file(
        &self,
        file_id: Uuid,
        location: &str,
        opts: &MigrateOptions,
    ) -> FilesResult<FileInstance> {
        let src = self.files.get(file_id).await?;
        if src.writable {
            return Err(FilesError::InvalidOperation(format!(
                "file {} is still being written",
                file_id
            )));
        }
        if !src.readable {
            return Err(FilesError::FileUnreadable(file_id));
        }
        let location = self.objects.get_location(location).await?;
        let backend = opts.backend.clone().unwrap_or_else(|| src.backend.clone());

        let staged = self.files.copy_contents(&src, &location, &backend).await?;
        if let Err(err) = self.check_copy(&src, &staged).await {
            self.files.discard(&staged).await;
            return Err(err);
        }

        let relinked = match self.relink(&src, &staged).await {
            Ok(relinked) => relinked,
            Err(err) => {
                self.files.discard(&staged).await;
                return Err(err);
            }
        };
        let (dst, versions) = relinked;
        info!(
            src = %src.id,
            dst = %dst.id,
            location = %location.name,
            versions,
            "file migrated"
        );

        if opts.post_fixity_check {
            let check = self
                .files
                .verify_checksum(dst.id, VerifyOptions::default())
                .await?;
            if check.outcome != CheckOutcome::Passed {
                warn!(file_id = %dst.id, outcome = ?check.outcome, "migrated copy failed fixity check");
            }
        }
        if opts.remove_source && !self.files.remove_file_data(src.id).await? {
            warn!(file_id = %src.id, "source still referenced after migration; kept");
        }
        self.files.get(dst.id).await
    }

    /// The copy must hash to the source's recorded checksum, using the
    /// source's algorithm.
    async fn check_copy(&self, src: &FileInstance, staged: &StagedFile) -> FilesResult<()> {
        let expected = src.checksum.clone().unwrap_or_default();
        let actual = match ChecksumAlgorithm::of_checksum(&expected) {
            Some(algorithm) if algorithm != self.files.backends().algorithm() => {
                let backend = self.files.backends().backend(&staged.backend, &staged.uri)?;
                let mut reader = backend.open().await?;
                let (_, checksum) = hash_reader(&mut reader, algorithm, DEFAULT_CHUNK_SIZE, None)
                    .await
                    .map_err(crate::storage::BackendError::from)?;
                checksum
            }
            _ => staged.checksum.clone(),
        };
        if actual != expected || staged.size != src.size_bytes() {
            return Err(FilesError::ChecksumMismatch {
                file_id: src.id,
                expected,
                actual,
            });
        }
        Ok(())
    }

    async fn relink(
        &self,
        src: &FileInstance,
        staged: &StagedFile,
    ) -> FilesResult<(FileInstance, u64)> {
        let mut tx = self.db.begin().await?;
        let mut dst = FileRegistry::insert_staged(&mut tx, staged).await?;
        if let Some(checksum) = &src.checksum {
            // Keep the recorded algorithm so history stays comparable.
            if Some(checksum) != dst.checksum.as_ref() {
                dst = sqlx::query_as::<_, FileInstance>(&format!(
                    "UPDATE file_instances SET checksum = ? WHERE id = ? RETURNING {FILE_COLUMNS}"
                ))
                .bind(checksum)
                .bind(dst.id)
                .fetch_one(&mut *tx)
                .await?;
            }
        }
        let versions = sqlx::query(
            "UPDATE object_versions SET file_id = ?, updated_at = ? WHERE file_id = ?",
        )
        .bind(dst.id)
        .bind(chrono::Utc::now())
        .bind(src.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query("UPDATE multipart_uploads SET file_id = ? WHERE file_id = ?")
            .bind(dst.id)
            .bind(src.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok((dst, versions))
    }
}
