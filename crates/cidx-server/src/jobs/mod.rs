//! Job Queue: durable, deduplicated, concurrency-capped background work
//! with FIFO-per-kind scheduling, timeouts, callbacks, and maintenance
//! drain.
//!
//! The polling/shutdown-signal shape is grounded on
//! `codetriever_indexing::worker::BackgroundWorker` (`WorkerConfig`, an
//! `Arc<AtomicBool>` shutdown flag, a `sleep`-based poll loop) generalized
//! from a two-level parse/embed pipeline into a single generic executor
//! dispatch, since CIDX's job kinds (`AddGoldenRepo`, `RefreshGoldenRepo`,
//! …) are heterogeneous rather than one fixed pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cidx_core::error::{CidxError, CidxResult};
use cidx_core::model::{Job, JobKind, JobStatus};
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Executes the side effects of one job kind. Implemented by the
/// top-level wiring in `main.rs`, which has access to the Repo Manager,
/// Store, and Embedder this job queue itself knows nothing about.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> CidxResult<serde_json::Value>;

    /// Per-kind timeout. Jobs exceeding this are hard-failed with a
    /// timeout error, never silently marked completed.
    fn timeout_for(&self, kind: &JobKind) -> Duration;
}

#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    pub max_concurrent_background_jobs: usize,
    pub poll_interval: Duration,
    pub callback_result_ttl: Duration,
}

pub struct JobQueue {
    pool: SqlitePool,
    config: JobQueueConfig,
    semaphore: Arc<Semaphore>,
    maintenance: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    http: reqwest::Client,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, config: JobQueueConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_background_jobs));
        Self {
            pool,
            config,
            semaphore,
            maintenance: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            http: reqwest::Client::new(),
        }
    }

    /// Marks any job left `Running` from a previous process as
    /// `failed("interrupted")`.
    pub async fn recover_on_boot(&self) -> CidxResult<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE jobs SET status = 'failed', error = 'interrupted', completed_at = ? \
             WHERE status = 'running'",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| CidxError::Internal(e.to_string()))?;
        Ok(())
    }

    pub fn enter_maintenance(&self) {
        self.maintenance.store(true, Ordering::SeqCst);
    }

    pub fn exit_maintenance(&self) {
        self.maintenance.store(false, Ordering::SeqCst);
    }

    pub fn is_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Whether the poll loop has been told to stop — the readiness
    /// signal `GET /health` reports for the job-queue component.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Enqueues a job, rejecting duplicates per `(kind, target-key)` and
    /// new submissions while in maintenance mode.
    pub async fn submit(
        &self,
        kind: JobKind,
        username: &str,
        callback_url: Option<String>,
    ) -> CidxResult<Uuid> {
        if self.is_maintenance() {
            return Err(CidxError::Maintenance(
                "server is in maintenance mode; new jobs are refused".to_string(),
            ));
        }

        let kind_label = kind.kind_label();
        let target_key = kind.target_key();

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM jobs WHERE kind_label = ? AND target_key = ? AND status IN ('pending', 'running')",
        )
        .bind(kind_label)
        .bind(&target_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CidxError::Internal(e.to_string()))?;

        if existing.is_some() {
            return Err(CidxError::Conflict(format!(
                "a {kind_label} job for '{target_key}' is already pending or running"
            )));
        }

        let job = Job::new(kind, username, callback_url);
        sqlx::query(
            "INSERT INTO jobs (id, kind_label, target_key, kind_json, username, status, progress, \
             created_at, started_at, completed_at, result_json, error, callback_url) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(kind_label)
        .bind(&target_key)
        .bind(serde_json::to_string(&job.kind).map_err(|e| CidxError::Internal(e.to_string()))?)
        .bind(&job.username)
        .bind("pending")
        .bind(0i64)
        .bind(job.created_at.to_rfc3339())
        .bind(Option::<String>::None)
        .bind(Option::<String>::None)
        .bind(Option::<String>::None)
        .bind(Option::<String>::None)
        .bind(&job.callback_url)
        .execute(&self.pool)
        .await
        .map_err(|e| CidxError::Internal(e.to_string()))?;

        Ok(job.id)
    }

    pub async fn get_job(&self, id: Uuid) -> CidxResult<Job> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT id, kind_json, username, status, progress, created_at, started_at, \
             completed_at, result_json, error, callback_url FROM jobs WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CidxError::Internal(e.to_string()))?;

        row.ok_or_else(|| CidxError::NotFound(format!("job '{id}' not found")))?
            .into_job()
    }

    /// Orphan-cleanup sweep: any job `Running` for longer than
    /// `DrainTimeout = 1.5 * max configured job timeout` is failed with
    /// `"orphaned"`.
    pub async fn sweep_orphans(&self, max_configured_timeout: Duration) -> CidxResult<u64> {
        let drain_timeout = max_configured_timeout.mul_f64(1.5);
        let cutoff = Utc::now() - chrono::Duration::from_std(drain_timeout).unwrap_or_default();

        let result = sqlx::query(
            "UPDATE jobs SET status = 'failed', error = 'orphaned', completed_at = ? \
             WHERE status = 'running' AND started_at IS NOT NULL AND started_at < ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| CidxError::Internal(e.to_string()))?;

        Ok(result.rows_affected())
    }

    /// Runs the worker poll loop until [`JobQueue::request_shutdown`] is
    /// called. Each pending job acquires a semaphore permit (bounding
    /// concurrency to `max_concurrent_background_jobs`) before its
    /// executor task is spawned, so the loop itself never blocks on a
    /// single slow job.
    pub async fn run(self: Arc<Self>, executor: Arc<dyn JobExecutor>) {
        info!("job queue worker loop starting");
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.claim_next_pending().await {
                Ok(Some(job)) => {
                    let permit = self.semaphore.clone().acquire_owned().await.expect("semaphore closed");
                    let queue = self.clone();
                    let executor = executor.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        queue.run_one(job, executor.as_ref()).await;
                    });
                }
                Ok(None) => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(e) => {
                    error!(error = %e, "failed to poll for pending jobs");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
        info!("job queue worker loop stopped");
    }

    /// FIFO within `(kind)`: earliest-created pending job of whichever
    /// kind is claimed first, atomically transitioned to `running` via a
    /// conditional `UPDATE` so two workers never both claim the same row.
    async fn claim_next_pending(&self) -> CidxResult<Option<Job>> {
        let candidate: Option<(String,)> =
            sqlx::query_as("SELECT id FROM jobs WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| CidxError::Internal(e.to_string()))?;

        let Some((id,)) = candidate else {
            return Ok(None);
        };

        let now = Utc::now().to_rfc3339();
        let updated = sqlx::query(
            "UPDATE jobs SET status = 'running', started_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(&now)
        .bind(&id)
        .execute(&self.pool)
        .await
        .map_err(|e| CidxError::Internal(e.to_string()))?;

        if updated.rows_affected() == 0 {
            return Ok(None); // raced with another worker
        }

        let job_id = Uuid::parse_str(&id).map_err(|e| CidxError::Internal(e.to_string()))?;
        Some(self.get_job(job_id).await).transpose()
    }

    async fn run_one(&self, job: Job, executor: &dyn JobExecutor) {
        let timeout = executor.timeout_for(&job.kind);
        let outcome = tokio::time::timeout(timeout, executor.execute(&job)).await;

        let (status, result, error) = match outcome {
            Ok(Ok(value)) => ("completed", Some(value), None),
            Ok(Err(e)) => ("failed", None, Some(e.to_string())),
            Err(_) => ("failed", None, Some("timeout".to_string())),
        };

        if let Err(e) = self.finish(job.id, status, result.as_ref(), error.as_deref()).await {
            error!(job_id = %job.id, error = %e, "failed to persist job completion");
            return;
        }

        if let Some(url) = &job.callback_url {
            self.post_callback(url, job.id, status).await;
        }
    }

    async fn finish(
        &self,
        id: Uuid,
        status: &str,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> CidxResult<()> {
        sqlx::query(
            "UPDATE jobs SET status = ?, completed_at = ?, result_json = ?, error = ?, progress = 100 \
             WHERE id = ?",
        )
        .bind(status)
        .bind(Utc::now().to_rfc3339())
        .bind(result.map(|v| v.to_string()))
        .bind(error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| CidxError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn post_callback(&self, url: &str, job_id: Uuid, status: &str) {
        let body = serde_json::json!({ "job_id": job_id, "status": status });
        if let Err(e) = self.http.post(url).json(&body).send().await {
            warn!(job_id = %job_id, %url, error = %e, "job callback delivery failed; result remains retrievable via GetJob");
        }
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    kind_json: String,
    username: String,
    status: String,
    progress: i64,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    result_json: Option<String>,
    error: Option<String>,
    callback_url: Option<String>,
}

impl JobRow {
    fn into_job(self) -> CidxResult<Job> {
        let parse_ts = |s: &str| -> CidxResult<chrono::DateTime<Utc>> {
            Ok(chrono::DateTime::parse_from_rfc3339(s)
                .map_err(|e| CidxError::Internal(e.to_string()))?
                .with_timezone(&Utc))
        };
        Ok(Job {
            id: Uuid::parse_str(&self.id).map_err(|e| CidxError::Internal(e.to_string()))?,
            kind: serde_json::from_str(&self.kind_json).map_err(|e| CidxError::Internal(e.to_string()))?,
            username: self.username,
            status: match self.status.as_str() {
                "pending" => JobStatus::Pending,
                "running" => JobStatus::Running,
                "completed" => JobStatus::Completed,
                "failed" => JobStatus::Failed,
                _ => JobStatus::Cancelled,
            },
            progress: self.progress as u8,
            created_at: parse_ts(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_ts).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_ts).transpose()?,
            result: self.result_json.as_deref().map(serde_json::from_str).transpose().map_err(|e| CidxError::Internal(e.to_string()))?,
            error: self.error,
            callback_url: self.callback_url,
        })
    }
}

/// Mapping of `kind_label -> configured timeout`, used by the default
/// executor wiring when no per-kind override is present.
pub type KindTimeouts = HashMap<&'static str, Duration>;

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoExecutor;

    #[async_trait]
    impl JobExecutor for EchoExecutor {
        async fn execute(&self, job: &Job) -> CidxResult<serde_json::Value> {
            Ok(serde_json::json!({ "ok": true, "kind": job.kind.kind_label() }))
        }

        fn timeout_for(&self, _kind: &JobKind) -> Duration {
            Duration::from_secs(5)
        }
    }

    async fn test_queue() -> JobQueue {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::db::migrate(&pool).await.unwrap();
        JobQueue::new(
            pool,
            JobQueueConfig {
                max_concurrent_background_jobs: 2,
                poll_interval: Duration::from_millis(10),
                callback_result_ttl: Duration::from_secs(60),
            },
        )
    }

    #[tokio::test]
    async fn duplicate_pending_job_is_rejected() {
        let queue = test_queue().await;
        let kind = JobKind::RefreshGoldenRepo { alias: "foo-global".to_string() };
        queue.submit(kind.clone(), "alice", None).await.unwrap();
        let err = queue.submit(kind, "alice", None).await.unwrap_err();
        assert!(matches!(err, CidxError::Conflict(_)));
    }

    #[tokio::test]
    async fn maintenance_mode_rejects_new_submissions() {
        let queue = test_queue().await;
        queue.enter_maintenance();
        let err = queue
            .submit(JobKind::OrphanSweep, "alice", None)
            .await
            .unwrap_err();
        assert!(matches!(err, CidxError::Maintenance(_)));
    }

    #[tokio::test]
    async fn claim_and_run_completes_job() {
        let queue = Arc::new(test_queue().await);
        let id = queue
            .submit(JobKind::OrphanSweep, "alice", None)
            .await
            .unwrap();
        let job = queue.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(job.id, id);
        queue.run_one(job, &EchoExecutor).await;
        let finished = queue.get_job(id).await.unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn recover_on_boot_marks_running_jobs_interrupted() {
        let queue = test_queue().await;
        let id = queue.submit(JobKind::OrphanSweep, "alice", None).await.unwrap();
        queue.claim_next_pending().await.unwrap();
        queue.recover_on_boot().await.unwrap();
        let job = queue.get_job(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("interrupted"));
    }
}
