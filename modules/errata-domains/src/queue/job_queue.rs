//! Durable job table backing the queue adapter.
//!
//! Deliberately small: one row per job key, at-least-once delivery through
//! `FOR UPDATE SKIP LOCKED`, an attempt budget and exponential backoff.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::adapter::JobQueueConnector;

const RETRY_BASE_DELAY_MS: u64 = 30_000;
const MAX_RETRY_DELAY_MS: u64 = 15 * 60_000;
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// A lock older than this belongs to a dead worker and may be retaken.
pub const STALE_LOCK: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("queue connection failed: {0}")]
    Connect(String),

    #[error("queue shutdown failed: {0}")]
    Shutdown(Arc<str>),

    #[error("queue storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    /// Deduplication key; one logical job per key.
    pub job_key: String,
    pub task: String,
    pub payload: Value,
    pub max_attempts: i32,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub job_key: String,
    pub task: String,
    pub payload: Value,
    /// 1-based attempt number of this delivery.
    pub attempts: i32,
    pub max_attempts: i32,
}

impl Job {
    pub fn is_final_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new job row was written.
    Queued,
    /// Collapsed onto a waiting job with the same key.
    Merged,
    /// A worker is executing the job with this key right now.
    AlreadyRunning,
    /// A locked job with this key was detached and a fresh one queued.
    Replaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailResult {
    Retried { attempts: i32, delay_ms: u64 },
    TerminalFailed { attempts: i32 },
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn add_job(&self, job: NewJob) -> Result<EnqueueOutcome, QueueError>;

    /// Like `add_job`, but a job still locked under this key is detached:
    /// it keeps its row for the old holder to settle but can never be taken
    /// again, and a fresh job takes over the key.
    async fn replace_job(&self, job: NewJob) -> Result<EnqueueOutcome, QueueError>;

    /// Lock the next due job for `worker`, counting one attempt.
    async fn take_job(&self, worker: &str) -> Result<Option<Job>, QueueError>;

    async fn complete_job(&self, job: &Job) -> Result<(), QueueError>;

    /// Release the job for a later attempt, or fail it permanently once the
    /// attempt budget is spent.
    async fn fail_job(&self, job: &Job, error: &str) -> Result<FailResult, QueueError>;

    async fn shutdown(&self) -> Result<(), QueueError>;
}

/// Insert the job, or revive a waiting, failed or abandoned one under the
/// same key with at most one attempt left. A running job is left alone.
async fn upsert_job<'e, E>(executor: E, job: &NewJob) -> Result<EnqueueOutcome, QueueError>
where
    E: sqlx::PgExecutor<'e>,
{
    let row = sqlx::query_as::<_, (bool,)>(
        r#"
        INSERT INTO investigation_jobs (id, job_key, task, payload, max_attempts, run_at)
        VALUES ($1, $2, $3, $4, $5, NOW())
        ON CONFLICT (job_key) DO UPDATE
        SET payload = EXCLUDED.payload,
            run_at = LEAST(investigation_jobs.run_at, EXCLUDED.run_at),
            locked_at = NULL,
            locked_by = NULL,
            failed_at = NULL,
            attempts = LEAST(investigation_jobs.attempts, investigation_jobs.max_attempts - 1)
        WHERE investigation_jobs.locked_at IS NULL
           OR investigation_jobs.locked_at < NOW() - make_interval(secs => $6)
        RETURNING (xmax = 0)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&job.job_key)
    .bind(&job.task)
    .bind(&job.payload)
    .bind(job.max_attempts)
    .bind(STALE_LOCK.as_secs_f64())
    .fetch_optional(executor)
    .await?;

    Ok(match row {
        Some((true,)) => EnqueueOutcome::Queued,
        Some((false,)) => EnqueueOutcome::Merged,
        None => EnqueueOutcome::AlreadyRunning,
    })
}

pub fn compute_retry_delay_ms(attempts: i32) -> u64 {
    let exponent = (attempts.max(1) as u32).min(MAX_BACKOFF_EXPONENT);
    let factor = 1_u64.checked_shl(exponent).unwrap_or(u64::MAX);
    RETRY_BASE_DELAY_MS.saturating_mul(factor).min(MAX_RETRY_DELAY_MS)
}

// =============================================================================
// Postgres
// =============================================================================

pub struct PgJobQueue {
    pool: PgPool,
    owns_pool: bool,
}

impl PgJobQueue {
    /// Share an existing pool; `shutdown` leaves it open.
    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            owns_pool: false,
        }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn add_job(&self, job: NewJob) -> Result<EnqueueOutcome, QueueError> {
        let outcome = upsert_job(&self.pool, &job).await?;
        debug!(job_key = %job.job_key, ?outcome, "Job enqueued");
        Ok(outcome)
    }

    async fn replace_job(&self, job: NewJob) -> Result<EnqueueOutcome, QueueError> {
        let mut tx = self.pool.begin().await?;

        let detached = sqlx::query_as::<_, (Uuid, Option<String>)>(
            r#"
            UPDATE investigation_jobs
            SET job_key = job_key || ':detached:' || id::text,
                failed_at = NOW(),
                last_error = 'superseded by recovery'
            WHERE job_key = $1 AND locked_at IS NOT NULL
            RETURNING id, locked_by
            "#,
        )
        .bind(&job.job_key)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = upsert_job(&mut *tx, &job).await?;
        tx.commit().await?;

        let outcome = match detached {
            Some((id, locked_by)) => {
                warn!(
                    job_key = %job.job_key,
                    detached_job = %id,
                    locked_by = locked_by.as_deref().unwrap_or("-"),
                    "Detached locked job"
                );
                EnqueueOutcome::Replaced
            }
            None => outcome,
        };
        debug!(job_key = %job.job_key, ?outcome, "Job requeued");
        Ok(outcome)
    }

    async fn take_job(&self, worker: &str) -> Result<Option<Job>, QueueError> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE investigation_jobs
            SET locked_at = NOW(), locked_by = $1, attempts = attempts + 1
            WHERE id = (
                SELECT id FROM investigation_jobs
                WHERE failed_at IS NULL
                  AND run_at <= NOW()
                  AND attempts < max_attempts
                  AND (locked_at IS NULL OR locked_at < NOW() - make_interval(secs => $2))
                ORDER BY run_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, job_key, task, payload, attempts, max_attempts
            "#,
        )
        .bind(worker)
        .bind(STALE_LOCK.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn complete_job(&self, job: &Job) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM investigation_jobs WHERE id = $1")
            .bind(job.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail_job(&self, job: &Job, error: &str) -> Result<FailResult, QueueError> {
        if job.is_final_attempt() {
            sqlx::query(
                r#"
                UPDATE investigation_jobs
                SET failed_at = NOW(), locked_at = NULL, locked_by = NULL, last_error = $2
                WHERE id = $1
                "#,
            )
            .bind(job.id)
            .bind(error)
            .execute(&self.pool)
            .await?;
            warn!(job_key = %job.job_key, attempts = job.attempts, "Job failed permanently");
            return Ok(FailResult::TerminalFailed {
                attempts: job.attempts,
            });
        }

        let delay_ms = compute_retry_delay_ms(job.attempts);
        sqlx::query(
            r#"
            UPDATE investigation_jobs
            SET run_at = NOW() + make_interval(secs => $2),
                locked_at = NULL,
                locked_by = NULL,
                last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .bind(delay_ms as f64 / 1000.0)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(FailResult::Retried {
            attempts: job.attempts,
            delay_ms,
        })
    }

    async fn shutdown(&self) -> Result<(), QueueError> {
        if self.owns_pool {
            self.pool.close().await;
        }
        Ok(())
    }
}

/// Opens the queue's own small pool on first use.
pub struct PgJobQueueConnector {
    database_url: String,
}

impl PgJobQueueConnector {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

#[async_trait]
impl JobQueueConnector for PgJobQueueConnector {
    async fn connect(&self) -> Result<Arc<dyn JobQueue>, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(&self.database_url)
            .await
            .map_err(|e| QueueError::Connect(e.to_string()))?;

        sqlx::query("SELECT 1 FROM investigation_jobs LIMIT 0")
            .execute(&pool)
            .await
            .map_err(|e| QueueError::Connect(format!("investigation_jobs unavailable: {e}")))?;

        Ok(Arc::new(PgJobQueue {
            pool,
            owns_pool: true,
        }))
    }
}
