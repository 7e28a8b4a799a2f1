//! src/services/scheduler.rs
//!
//! SyncScheduler: single-flight queue of sync jobs.
//!
//! Jobs are rows in `sync_jobs`. Admission into `running` goes through one
//! compare-and-set on a process-wide slot, so at most one job runs no matter
//! how many triggers arrive. The running job's task drains the queue in id
//! order until nothing is pending, then releases the slot.

use crate::{
    models::{
        folder::normalize_scope,
        sync_job::{JOB_COLUMNS, JobProgress, JobStatus, SyncJob, SyncJobType},
    },
    services::{
        metadata_service::MetadataService,
        object_client::ObjectClient,
        reconciler::{ReconcileConfig, ReconcileError, Reconciler},
        thumbnail_service::ThumbnailService,
    },
};
use chrono::Utc;
use sqlx::SqlitePool;
use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Duration,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Slot value while no job is running.
const SLOT_EMPTY: i64 = 0;
/// Slot value while an admission check is choosing the next job.
const SLOT_CLAIMED: i64 = -1;

const PROGRESS_FLUSH_INTERVAL: Duration = Duration::from_secs(1);
/// Backoff for recording a job's terminal state: first delay, cap, attempts.
const OUTCOME_RETRY_DELAY: Duration = Duration::from_millis(100);
const OUTCOME_RETRY_MAX_DELAY: Duration = Duration::from_secs(5);
const OUTCOME_WRITE_ATTEMPTS: u32 = 10;
/// Finished jobs stay in the active list this long.
const RECENT_JOB_MINUTES: i64 = 10;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub metadata_size_threshold: i64,
    /// Period of automatic full scans. Zero disables them.
    pub interval: Duration,
    /// Timeout applied to each object-store call.
    pub io_timeout: Duration,
    pub backlog_concurrency: usize,
    /// Generate pending thumbnails after full and folder scans.
    pub backlog_thumbnails: bool,
    pub autostart: bool,
    pub list_page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            metadata_size_threshold: 50 * 1024 * 1024,
            interval: Duration::ZERO,
            io_timeout: Duration::from_secs(30),
            backlog_concurrency: 4,
            backlog_thumbnails: true,
            autostart: true,
            list_page_size: 1000,
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid sync job: {0}")]
    InvalidJob(String),
    #[error("sync job {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    db: Arc<SqlitePool>,
    reconciler: Reconciler,
    metadata: MetadataService,
    thumbnails: ThumbnailService,
    config: SyncConfig,
    slot: AtomicI64,
    enabled: AtomicBool,
    live_progress: Mutex<Option<Arc<JobProgress>>>,
    timer: Mutex<Option<CancellationToken>>,
}

impl SyncScheduler {
    pub fn new(
        db: Arc<SqlitePool>,
        client: ObjectClient,
        thumbnails: ThumbnailService,
        config: SyncConfig,
    ) -> Self {
        let reconciler = Reconciler::new(
            db.clone(),
            client.clone(),
            ReconcileConfig {
                thumbnail_size_threshold: thumbnails.config().size_threshold,
                metadata_size_threshold: config.metadata_size_threshold,
                ignored_prefixes: thumbnails
                    .artifacts()
                    .bucket_prefix()
                    .map(str::to_string)
                    .into_iter()
                    .collect(),
            },
        );
        let metadata = MetadataService::new(db.clone(), client, config.metadata_size_threshold);
        Self {
            inner: Arc::new(Inner {
                db,
                reconciler,
                metadata,
                thumbnails,
                config,
                slot: AtomicI64::new(SLOT_EMPTY),
                enabled: AtomicBool::new(false),
                live_progress: Mutex::new(None),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Fail jobs a previous process left `running`. Call before `start`.
    pub async fn recover(&self) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE sync_jobs SET status = 'failed', completed_at = ?,
                    error_message = 'interrupted by restart'
             WHERE status = 'running'",
        )
        .bind(Utc::now())
        .execute(&*self.inner.db)
        .await?;
        if result.rows_affected() > 0 {
            warn!("marked {} interrupted sync jobs as failed", result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    /// Create a pending job and try to start it.
    pub async fn enqueue(
        &self,
        job_type: SyncJobType,
        folder_path: Option<&str>,
    ) -> SchedulerResult<SyncJob> {
        let scope = folder_path.and_then(normalize_scope);
        match (job_type, &scope) {
            (SyncJobType::FullScan, Some(_)) => {
                return Err(SchedulerError::InvalidJob(
                    "full_scan does not take a folder path".into(),
                ));
            }
            (SyncJobType::FolderScan, None) => {
                return Err(SchedulerError::InvalidJob(
                    "folder_scan requires a folder path".into(),
                ));
            }
            _ => {}
        }

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO sync_jobs (job_type, status, folder_path, created_at)
             VALUES (?, 'pending', ?, ?) RETURNING id",
        )
        .bind(job_type)
        .bind(&scope)
        .bind(Utc::now())
        .fetch_one(&*self.inner.db)
        .await?;
        info!("enqueued {} job {} (scope {:?})", job_type, id, scope);

        self.kick().await?;
        self.job(id).await
    }

    pub async fn job(&self, id: i64) -> SchedulerResult<SyncJob> {
        sqlx::query_as::<_, SyncJob>(&format!(
            "SELECT {} FROM sync_jobs WHERE id = ?",
            JOB_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.inner.db)
        .await?
        .ok_or(SchedulerError::NotFound(id))
    }

    /// True while a job occupies the single-flight slot.
    pub fn is_running(&self) -> bool {
        self.inner.slot.load(Ordering::SeqCst) != SLOT_EMPTY
    }

    /// True while the scheduler drains the queue.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// The running job with live progress counters.
    pub async fn current(&self) -> SchedulerResult<Option<SyncJob>> {
        let id = self.inner.slot.load(Ordering::SeqCst);
        if id <= SLOT_EMPTY {
            return Ok(None);
        }
        let mut job = match self.job(id).await {
            Ok(job) => job,
            Err(SchedulerError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let live = self
            .inner
            .live_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let (JobStatus::Running, Some(progress)) = (job.status, live) {
            (job.processed_items, job.total_items) = progress.snapshot();
        }
        Ok(Some(job))
    }

    /// Pending and running jobs, plus jobs that finished recently.
    pub async fn active_jobs(&self) -> SchedulerResult<Vec<SyncJob>> {
        let jobs = sqlx::query_as::<_, SyncJob>(&format!(
            "SELECT {} FROM sync_jobs
             WHERE status IN ('pending', 'running')
                OR id IN (SELECT id FROM sync_jobs WHERE completed_at IS NOT NULL
                          ORDER BY id DESC LIMIT 100)
             ORDER BY id",
            JOB_COLUMNS
        ))
        .fetch_all(&*self.inner.db)
        .await?;

        let cutoff = Utc::now() - chrono::Duration::minutes(RECENT_JOB_MINUTES);
        Ok(jobs
            .into_iter()
            .filter(|job| {
                !job.status.is_terminal() || job.completed_at.is_some_and(|at| at >= cutoff)
            })
            .collect())
    }

    /// Enable draining, start the periodic trigger and run anything pending.
    pub async fn start(&self) -> SchedulerResult<()> {
        if !self.inner.enabled.swap(true, Ordering::SeqCst) {
            info!("sync scheduler started");
            self.spawn_timer();
        }
        self.kick().await
    }

    /// Stop admitting jobs. A running job finishes on its own.
    pub fn stop(&self) {
        if self.inner.enabled.swap(false, Ordering::SeqCst) {
            info!("sync scheduler stopped");
        }
        if let Some(token) = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }

    fn spawn_timer(&self) {
        let period = self.inner.config.interval;
        if period.is_zero() {
            return;
        }
        let token = CancellationToken::new();
        if let Some(previous) = self
            .inner
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone())
        {
            previous.cancel();
        }

        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = this.periodic_scan().await {
                            error!("periodic full_scan failed to enqueue: {}", err);
                        }
                    }
                }
            }
        });
    }

    async fn periodic_scan(&self) -> SchedulerResult<()> {
        let busy: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_jobs WHERE status IN ('pending', 'running')",
        )
        .fetch_one(&*self.inner.db)
        .await?;
        if busy == 0 {
            self.enqueue(SyncJobType::FullScan, None).await?;
        }
        Ok(())
    }

    /// Admit the next pending job if the slot is free and hand it to a
    /// drain task.
    async fn kick(&self) -> SchedulerResult<()> {
        if let Some(job) = self.admit_next().await? {
            let this = self.clone();
            tokio::spawn(async move { this.drain(job).await });
        }
        Ok(())
    }

    /// Claim the slot and promote the oldest pending job to `running`.
    async fn admit_next(&self) -> SchedulerResult<Option<SyncJob>> {
        loop {
            if !self.is_enabled() {
                return Ok(None);
            }
            if self
                .inner
                .slot
                .compare_exchange(SLOT_EMPTY, SLOT_CLAIMED, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Ok(None);
            }

            match self.promote_oldest_pending().await {
                Ok(Some(job)) => {
                    self.inner.slot.store(job.id, Ordering::SeqCst);
                    return Ok(Some(job));
                }
                Ok(None) => {
                    self.inner.slot.store(SLOT_EMPTY, Ordering::SeqCst);
                    // A job enqueued while the slot was claimed could not kick.
                    if !self.has_pending().await? {
                        return Ok(None);
                    }
                }
                Err(err) => {
                    self.inner.slot.store(SLOT_EMPTY, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
    }

    async fn promote_oldest_pending(&self) -> SchedulerResult<Option<SyncJob>> {
        let job = sqlx::query_as::<_, SyncJob>(&format!(
            "UPDATE sync_jobs SET status = 'running', started_at = ?
             WHERE id = (SELECT id FROM sync_jobs WHERE status = 'pending' ORDER BY id LIMIT 1)
             RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(Utc::now())
        .fetch_optional(&*self.inner.db)
        .await?;
        Ok(job)
    }

    async fn has_pending(&self) -> SchedulerResult<bool> {
        let pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sync_jobs WHERE status = 'pending'")
                .fetch_one(&*self.inner.db)
                .await?;
        Ok(pending > 0)
    }

    async fn drain(self, mut job: SyncJob) {
        loop {
            if !self.execute(&job).await {
                // The row still says `running`; keep the slot so no other job
                // is promoted next to it. `recover` settles it on restart.
                error!(
                    "sync job {} outcome could not be recorded; scheduler halted",
                    job.id
                );
                return;
            }
            self.inner.slot.store(SLOT_EMPTY, Ordering::SeqCst);
            match self.admit_next().await {
                Ok(Some(next)) => job = next,
                Ok(None) => break,
                Err(err) => {
                    error!("failed to admit next sync job: {}", err);
                    break;
                }
            }
        }
    }

    /// Run one job to a terminal state, flushing progress along the way.
    /// Returns whether the terminal state was recorded.
    async fn execute(&self, job: &SyncJob) -> bool {
        info!("sync job {} ({}) running", job.id, job.job_type);
        let progress = Arc::new(JobProgress::default());
        *self
            .inner
            .live_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(progress.clone());

        let result = {
            let work = self.run_job(job, &progress);
            tokio::pin!(work);
            let mut ticker = tokio::time::interval(PROGRESS_FLUSH_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    result = &mut work => break result,
                    _ = ticker.tick() => self.flush_progress(job.id, &progress).await,
                }
            }
        };

        let (processed, total) = progress.snapshot();
        let (status, message) = match &result {
            Ok(()) => {
                info!("sync job {} completed ({}/{} items)", job.id, processed, total);
                (JobStatus::Completed, None)
            }
            Err(err) => {
                warn!("sync job {} failed: {}", job.id, err);
                (JobStatus::Failed, Some(err.to_string()))
            }
        };

        let mut delay = OUTCOME_RETRY_DELAY;
        let mut recorded = false;
        for attempt in 1..=OUTCOME_WRITE_ATTEMPTS {
            match self
                .record_outcome(job.id, status, message.as_deref(), processed, total)
                .await
            {
                Ok(()) => {
                    recorded = true;
                    break;
                }
                Err(err) => {
                    error!(
                        "failed to record outcome of sync job {} (attempt {}/{}): {}",
                        job.id, attempt, OUTCOME_WRITE_ATTEMPTS, err
                    );
                    if attempt < OUTCOME_WRITE_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(OUTCOME_RETRY_MAX_DELAY);
                    }
                }
            }
        }

        *self
            .inner
            .live_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        recorded
    }

    async fn record_outcome(
        &self,
        id: i64,
        status: JobStatus,
        message: Option<&str>,
        processed: i64,
        total: i64,
    ) -> SchedulerResult<()> {
        sqlx::query(
            "UPDATE sync_jobs SET status = ?, completed_at = ?, error_message = ?,
                    processed_items = ?, total_items = ?
             WHERE id = ?",
        )
        .bind(status)
        .bind(Utc::now())
        .bind(message)
        .bind(processed)
        .bind(total)
        .bind(id)
        .execute(&*self.inner.db)
        .await?;
        Ok(())
    }

    async fn flush_progress(&self, id: i64, progress: &JobProgress) {
        let (processed, total) = progress.snapshot();
        if let Err(err) =
            sqlx::query("UPDATE sync_jobs SET processed_items = ?, total_items = ? WHERE id = ?")
                .bind(processed)
                .bind(total)
                .bind(id)
                .execute(&*self.inner.db)
                .await
        {
            warn!("failed to flush progress of sync job {}: {}", id, err);
        }
    }

    async fn run_job(&self, job: &SyncJob, progress: &JobProgress) -> SchedulerResult<()> {
        let inner = &self.inner;
        let scope = job.folder_path.as_deref();
        match job.job_type {
            SyncJobType::FullScan | SyncJobType::FolderScan => {
                let report = inner.reconciler.reconcile(scope, progress).await?;
                if !report.errors.is_empty() {
                    warn!(
                        "sync job {}: {} objects could not be reconciled",
                        job.id,
                        report.errors.len()
                    );
                }
                self.delete_artifacts(&report.orphaned_thumbnails).await;
                if inner.config.backlog_thumbnails {
                    let backlog = inner
                        .thumbnails
                        .run_backlog(scope, inner.config.backlog_concurrency)
                        .await;
                    info!(
                        "sync job {} backlog: {} generated, {} skipped, {} unavailable",
                        job.id, backlog.generated, backlog.skipped, backlog.unavailable
                    );
                }
            }
            SyncJobType::MetadataScan => {
                let report = inner.metadata.extract_scope(scope, progress).await?;
                info!(
                    "sync job {} metadata: {} extracted, {} skipped, {} errors",
                    job.id,
                    report.extracted,
                    report.skipped,
                    report.errors.len()
                );
            }
            SyncJobType::Cleanup => {
                let sweep = inner.thumbnails.sweep_stale().await;
                for err in &sweep.errors {
                    warn!("sync job {} sweep: {}", job.id, err);
                }
                let purge = inner.reconciler.purge_missing(scope, progress).await?;
                self.delete_artifacts(&purge.orphaned_thumbnails).await;
            }
        }
        Ok(())
    }

    async fn delete_artifacts(&self, paths: &[String]) {
        for path in paths {
            self.inner.thumbnails.delete_thumbnail(path).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        models::photo::ThumbnailStatus,
        services::{
            artifact_store::ArtifactLocation,
            object_client::StoreConfig,
            test_support::{insert_photo, jpeg_bytes},
            thumbnail_service::ThumbnailConfig,
        },
    };
    use bytes::Bytes;
    use tokio::time::{Instant, sleep};

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<SqlitePool>,
        client: ObjectClient,
        scheduler: SyncScheduler,
    }

    fn fixture_with(db: Arc<SqlitePool>, client: ObjectClient, config: SyncConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let thumbnails = ThumbnailService::new(
            db.clone(),
            client.clone(),
            ThumbnailConfig {
                location: ArtifactLocation::Local {
                    dir: dir.path().to_path_buf(),
                },
                max_dimension: 32,
                size_threshold: 20 * 1024,
                ..Default::default()
            },
        );
        let scheduler = SyncScheduler::new(db.clone(), client.clone(), thumbnails, config);
        Fixture {
            _dir: dir,
            db,
            client,
            scheduler,
        }
    }

    async fn memory_fixture() -> Fixture {
        let db = db::connect_in_memory().await.unwrap();
        let client = ObjectClient::new(&StoreConfig::Memory, Duration::from_secs(5)).unwrap();
        fixture_with(db, client, SyncConfig::default())
    }

    /// A bucket whose endpoint accepts connections and never answers, so
    /// every call runs into the I/O timeout.
    async fn unresponsive_fixture() -> (Fixture, tokio::net::TcpListener) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let db = db::connect_in_memory().await.unwrap();
        let client = ObjectClient::new(
            &StoreConfig::S3 {
                endpoint,
                bucket: "photos".into(),
                access_key: "test".into(),
                secret_key: "test".into(),
                region: None,
            },
            Duration::from_millis(500),
        )
        .unwrap();
        (fixture_with(db, client, SyncConfig::default()), listener)
    }

    async fn wait_terminal(scheduler: &SyncScheduler, id: i64) -> SyncJob {
        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let job = scheduler.job(id).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            assert!(Instant::now() < deadline, "job {} never finished", id);
            sleep(Duration::from_millis(20)).await;
        }
    }

    async fn running_count(db: &SqlitePool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM sync_jobs WHERE status = 'running'")
            .fetch_one(db)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn full_scan_mirrors_and_materializes() {
        let fx = memory_fixture().await;
        fx.client
            .put_object("a/b/photo1.jpg", Bytes::from(jpeg_bytes(64, 48)), "image/jpeg")
            .await
            .unwrap();
        fx.client
            .put_object("a/photo2.jpg", Bytes::from(vec![0u8; 50 * 1024]), "image/jpeg")
            .await
            .unwrap();
        fx.scheduler.start().await.unwrap();

        let job = fx.scheduler.enqueue(SyncJobType::FullScan, None).await.unwrap();
        let job = wait_terminal(&fx.scheduler, job.id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!((job.processed_items, job.total_items), (2, 2));
        assert!(job.started_at.is_some() && job.completed_at.is_some());

        let statuses: Vec<(String, ThumbnailStatus)> =
            sqlx::query_as("SELECT s3_key, thumbnail_status FROM photos ORDER BY s3_key")
                .fetch_all(&*fx.db)
                .await
                .unwrap();
        assert_eq!(
            statuses,
            vec![
                ("a/b/photo1.jpg".to_string(), ThumbnailStatus::Generated),
                ("a/photo2.jpg".to_string(), ThumbnailStatus::SkippedSize),
            ]
        );

        // The slot is released right after the terminal row is written.
        sleep(Duration::from_millis(100)).await;
        assert!(!fx.scheduler.is_running());
        assert!(fx.scheduler.current().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cleanup_waits_for_the_running_scan_and_runs_after_its_failure() {
        let (fx, _listener) = unresponsive_fixture().await;
        fx.scheduler.start().await.unwrap();

        let scan = fx.scheduler.enqueue(SyncJobType::FullScan, None).await.unwrap();
        assert_eq!(scan.status, JobStatus::Running);
        let cleanup = fx.scheduler.enqueue(SyncJobType::Cleanup, None).await.unwrap();
        assert_eq!(cleanup.status, JobStatus::Pending);
        assert_eq!(fx.scheduler.current().await.unwrap().map(|j| j.id), Some(scan.id));

        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            assert!(running_count(&fx.db).await <= 1);
            if fx.scheduler.job(cleanup.id).await.unwrap().status.is_terminal() {
                break;
            }
            assert!(Instant::now() < deadline);
            sleep(Duration::from_millis(10)).await;
        }

        let scan = fx.scheduler.job(scan.id).await.unwrap();
        let cleanup = fx.scheduler.job(cleanup.id).await.unwrap();
        assert_eq!(scan.status, JobStatus::Failed);
        assert!(scan.error_message.unwrap().contains("listing"));
        assert_eq!(cleanup.status, JobStatus::Completed);
        assert!(cleanup.started_at.unwrap() >= scan.completed_at.unwrap());

        let active = fx.scheduler.active_jobs().await.unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn stopped_scheduler_only_queues() {
        let fx = memory_fixture().await;
        let job = fx.scheduler.enqueue(SyncJobType::Cleanup, None).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!fx.scheduler.is_running());

        fx.scheduler.start().await.unwrap();
        let job = wait_terminal(&fx.scheduler, job.id).await;
        assert_eq!(job.status, JobStatus::Completed);

        fx.scheduler.stop();
        let queued = fx
            .scheduler
            .enqueue(SyncJobType::MetadataScan, Some("a"))
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(
            fx.scheduler.job(queued.id).await.unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn scopes_are_validated_and_normalized() {
        let fx = memory_fixture().await;
        assert!(matches!(
            fx.scheduler.enqueue(SyncJobType::FullScan, Some("a")).await,
            Err(SchedulerError::InvalidJob(_))
        ));
        assert!(matches!(
            fx.scheduler.enqueue(SyncJobType::FolderScan, Some("/")).await,
            Err(SchedulerError::InvalidJob(_))
        ));
        let job = fx
            .scheduler
            .enqueue(SyncJobType::FolderScan, Some("/a/b/"))
            .await
            .unwrap();
        assert_eq!(job.folder_path.as_deref(), Some("a/b"));
        let full = fx.scheduler.enqueue(SyncJobType::FullScan, Some("/")).await.unwrap();
        assert!(full.folder_path.is_none());
    }

    #[tokio::test]
    async fn recover_fails_jobs_left_running() {
        let fx = memory_fixture().await;
        sqlx::query(
            "INSERT INTO sync_jobs (job_type, status, created_at, started_at)
             VALUES ('full_scan', 'running', ?1, ?1)",
        )
        .bind(Utc::now())
        .execute(&*fx.db)
        .await
        .unwrap();

        assert_eq!(fx.scheduler.recover().await.unwrap(), 1);
        let jobs = fx.scheduler.active_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert_eq!(jobs[0].error_message.as_deref(), Some("interrupted by restart"));
    }

    async fn job_count(db: &SqlitePool, job_type: Option<&str>) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM sync_jobs WHERE ?1 IS NULL OR job_type = ?1")
            .bind(job_type)
            .fetch_one(db)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn next_job_waits_until_the_outcome_is_recorded() {
        let fx = memory_fixture().await;
        sqlx::query(
            "CREATE TRIGGER reject_terminal BEFORE UPDATE OF status ON sync_jobs
             WHEN NEW.status IN ('completed', 'failed')
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END",
        )
        .execute(&*fx.db)
        .await
        .unwrap();
        fx.scheduler.start().await.unwrap();

        let first = fx.scheduler.enqueue(SyncJobType::Cleanup, None).await.unwrap();
        let second = fx.scheduler.enqueue(SyncJobType::Cleanup, None).await.unwrap();
        sleep(Duration::from_millis(400)).await;

        assert_eq!(running_count(&fx.db).await, 1);
        assert_eq!(fx.scheduler.job(first.id).await.unwrap().status, JobStatus::Running);
        assert_eq!(fx.scheduler.job(second.id).await.unwrap().status, JobStatus::Pending);
        assert!(fx.scheduler.is_running());

        sqlx::query("DROP TRIGGER reject_terminal")
            .execute(&*fx.db)
            .await
            .unwrap();
        let second = wait_terminal(&fx.scheduler, second.id).await;
        assert_eq!(second.status, JobStatus::Completed);
        assert_eq!(
            fx.scheduler.job(first.id).await.unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn periodic_trigger_enqueues_full_scans_until_stopped() {
        let db = db::connect_in_memory().await.unwrap();
        let client = ObjectClient::new(&StoreConfig::Memory, Duration::from_secs(5)).unwrap();
        let fx = fixture_with(
            db,
            client,
            SyncConfig {
                interval: Duration::from_millis(100),
                ..Default::default()
            },
        );
        fx.scheduler.start().await.unwrap();
        sleep(Duration::from_millis(450)).await;
        let scans = job_count(&fx.db, Some("full_scan")).await;
        assert!(scans >= 2, "expected repeated full scans, got {}", scans);
        assert_eq!(job_count(&fx.db, None).await, scans);

        fx.scheduler.stop();
        sleep(Duration::from_millis(50)).await;
        let after_stop = job_count(&fx.db, None).await;
        sleep(Duration::from_millis(400)).await;
        assert_eq!(job_count(&fx.db, None).await, after_stop);
    }

    #[tokio::test]
    async fn periodic_trigger_skips_while_work_is_queued_or_running() {
        let fx = memory_fixture().await;
        let queued = fx
            .scheduler
            .enqueue(SyncJobType::MetadataScan, Some("a"))
            .await
            .unwrap();

        fx.scheduler.periodic_scan().await.unwrap();
        assert_eq!(job_count(&fx.db, Some("full_scan")).await, 0);

        sqlx::query("UPDATE sync_jobs SET status = 'running' WHERE id = ?")
            .bind(queued.id)
            .execute(&*fx.db)
            .await
            .unwrap();
        fx.scheduler.periodic_scan().await.unwrap();
        assert_eq!(job_count(&fx.db, Some("full_scan")).await, 0);

        sqlx::query("UPDATE sync_jobs SET status = 'completed', completed_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(queued.id)
            .execute(&*fx.db)
            .await
            .unwrap();
        fx.scheduler.periodic_scan().await.unwrap();
        assert_eq!(job_count(&fx.db, Some("full_scan")).await, 1);
    }

    #[tokio::test]
    async fn progress_is_flushed_while_the_job_runs() {
        let (fx, _listener) = unresponsive_fixture().await;
        for key in ["a/1.jpg", "a/2.jpg", "a/3.jpg", "a/4.jpg"] {
            insert_photo(&fx.db, key, 100).await;
        }
        fx.scheduler.start().await.unwrap();
        let job = fx
            .scheduler
            .enqueue(SyncJobType::MetadataScan, Some("a"))
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let row = fx.scheduler.job(job.id).await.unwrap();
            assert_eq!(row.status, JobStatus::Running, "job ended before a flush");
            if row.processed_items >= 1 {
                assert_eq!(row.total_items, 4);
                break;
            }
            assert!(Instant::now() < deadline);
            sleep(Duration::from_millis(50)).await;
        }

        let job = wait_terminal(&fx.scheduler, job.id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!((job.processed_items, job.total_items), (4, 4));
    }

    #[tokio::test]
    async fn metadata_scan_extracts_scope() {
        let fx = memory_fixture().await;
        let bytes = jpeg_bytes(20, 10);
        fx.client
            .put_object("a/p.jpg", Bytes::from(bytes.clone()), "image/jpeg")
            .await
            .unwrap();
        insert_photo(&fx.db, "a/p.jpg", bytes.len() as i64).await;
        fx.scheduler.start().await.unwrap();

        let job = fx
            .scheduler
            .enqueue(SyncJobType::MetadataScan, Some("a"))
            .await
            .unwrap();
        let job = wait_terminal(&fx.scheduler, job.id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.processed_items, 1);
    }
}
