use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::models::claim::{Claim, ClaimDraft};
use super::models::investigation::{Investigation, InvestigationStatus};
use super::models::investigation_run::{InvestigationRun, RunState};

/// Everything a worker needs to investigate a claimed run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run: InvestigationRun,
    pub investigation: Investigation,
    /// Persisted claims of the parent investigation, for re-checks.
    pub prior_claims: Vec<ClaimDraft>,
}

/// Durable run/investigation store. Every mutating method is a single
/// conditional write; `false` means the guard did not match.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Take the lease if the investigation is PENDING, or PROCESSING with no
    /// owner or an expired lease. Moves the investigation to PROCESSING.
    async fn try_claim(
        &self,
        run_id: Uuid,
        worker: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn find_run_state(&self, run_id: Uuid) -> Result<Option<RunState>>;

    /// Push `lease_expires_at` forward if `worker` still owns a PROCESSING run.
    async fn extend_lease(
        &self,
        run_id: Uuid,
        worker: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn list_processing_runs(&self) -> Result<Vec<InvestigationRun>>;

    /// Clear lease and recovery fields and stamp `queued_at`, re-checking
    /// that the run is still recoverable at `cutoff`.
    async fn reset_for_recovery(
        &self,
        run_id: Uuid,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn load_context(&self, run_id: Uuid) -> Result<Option<RunContext>>;

    /// Persist approved claims and mark COMPLETE, guarded by lease ownership.
    async fn complete_run(
        &self,
        run_id: Uuid,
        worker: &str,
        prompt_id: Uuid,
        claims: &[ClaimDraft],
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn fail_run(
        &self,
        run_id: Uuid,
        worker: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Flag a run for the recovery sweep after a retryable failure. The lease
    /// itself is left to expire.
    async fn mark_retry_pending(&self, run_id: Uuid, worker: &str, now: DateTime<Utc>)
        -> Result<bool>;

    /// Flag an unowned PROCESSING run for the next sweep. Used when a reset
    /// run could not be handed back to the queue.
    async fn mark_recovery_due(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<bool>;
}

// =============================================================================
// Postgres
// =============================================================================

pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create an investigation and its run in one transaction.
    pub async fn create_investigation(
        &self,
        content: &str,
        parent_investigation_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<(Investigation, InvestigationRun)> {
        let mut tx = self.pool.begin().await?;

        let investigation = sqlx::query_as::<_, Investigation>(
            r#"
            INSERT INTO investigations (id, content, content_hash, status, parent_investigation_id, created_at, updated_at)
            VALUES ($1, $2, $3, 'PENDING', $4, $5, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(content)
        .bind(errata_core::content_hash(content))
        .bind(parent_investigation_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let run = sqlx::query_as::<_, InvestigationRun>(
            r#"
            INSERT INTO investigation_runs (id, investigation_id, queued_at)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(investigation.id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((investigation, run))
    }

    pub async fn find_claims(&self, investigation_id: Uuid) -> Result<Vec<Claim>> {
        sqlx::query_as::<_, Claim>(
            "SELECT * FROM claims WHERE investigation_id = $1 ORDER BY claim_index",
        )
        .bind(investigation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn try_claim(
        &self,
        run_id: Uuid,
        worker: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        // Locking both rows makes a blocked claimer re-evaluate the predicate
        // against the winner's committed lease.
        let claimed = sqlx::query_as::<_, (Uuid,)>(
            r#"
            WITH target AS (
                SELECT r.id AS run_id, i.id AS investigation_id
                FROM investigation_runs r
                JOIN investigations i ON i.id = r.investigation_id
                WHERE r.id = $1
                  AND (
                    i.status = 'PENDING'
                    OR (i.status = 'PROCESSING'
                        AND (r.lease_owner IS NULL OR r.lease_expires_at <= $3))
                  )
                FOR UPDATE OF r, i
            ),
            claimed_investigation AS (
                UPDATE investigations i
                SET status = 'PROCESSING', updated_at = $3
                FROM target t
                WHERE i.id = t.investigation_id
                RETURNING i.id
            )
            UPDATE investigation_runs r
            SET lease_owner = $2,
                lease_expires_at = $4,
                recover_after_at = NULL,
                started_at = $3,
                heartbeat_at = $3
            FROM target t
            WHERE r.id = t.run_id
            RETURNING r.id
            "#,
        )
        .bind(run_id)
        .bind(worker)
        .bind(now)
        .bind(lease_expires_at)
        .fetch_optional(&self.pool)
        .await
        .context("claim update failed")?;

        Ok(claimed.is_some())
    }

    async fn find_run_state(&self, run_id: Uuid) -> Result<Option<RunState>> {
        let run = sqlx::query_as::<_, InvestigationRun>(
            "SELECT * FROM investigation_runs WHERE id = $1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(run) = run else {
            return Ok(None);
        };

        let (status,) = sqlx::query_as::<_, (String,)>(
            "SELECT status FROM investigations WHERE id = $1",
        )
        .bind(run.investigation_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Some(RunState {
            run,
            status: status.parse()?,
        }))
    }

    async fn extend_lease(
        &self,
        run_id: Uuid,
        worker: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE investigation_runs r
            SET lease_expires_at = $4, heartbeat_at = $3
            FROM investigations i
            WHERE r.id = $1
              AND r.lease_owner = $2
              AND i.id = r.investigation_id
              AND i.status = 'PROCESSING'
            "#,
        )
        .bind(run_id)
        .bind(worker)
        .bind(now)
        .bind(lease_expires_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    async fn list_processing_runs(&self) -> Result<Vec<InvestigationRun>> {
        sqlx::query_as::<_, InvestigationRun>(
            r#"
            SELECT r.*
            FROM investigation_runs r
            JOIN investigations i ON i.id = r.investigation_id
            WHERE i.status = 'PROCESSING'
            ORDER BY r.queued_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    async fn reset_for_recovery(
        &self,
        run_id: Uuid,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE investigation_runs r
            SET lease_owner = NULL,
                lease_expires_at = NULL,
                recover_after_at = NULL,
                heartbeat_at = NULL,
                queued_at = $3
            FROM investigations i
            WHERE r.id = $1
              AND i.id = r.investigation_id
              AND i.status = 'PROCESSING'
              AND (
                (r.lease_expires_at IS NOT NULL AND r.lease_expires_at <= $2)
                OR (r.recover_after_at IS NOT NULL AND r.recover_after_at <= $2)
              )
            "#,
        )
        .bind(run_id)
        .bind(cutoff)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    async fn load_context(&self, run_id: Uuid) -> Result<Option<RunContext>> {
        let run = sqlx::query_as::<_, InvestigationRun>(
            "SELECT * FROM investigation_runs WHERE id = $1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(run) = run else {
            return Ok(None);
        };

        let investigation =
            sqlx::query_as::<_, Investigation>("SELECT * FROM investigations WHERE id = $1")
                .bind(run.investigation_id)
                .fetch_one(&self.pool)
                .await?;

        let prior_claims = match investigation.parent_investigation_id {
            Some(parent_id) => self
                .find_claims(parent_id)
                .await?
                .iter()
                .map(Claim::to_draft)
                .collect(),
            None => Vec::new(),
        };

        Ok(Some(RunContext {
            run,
            investigation,
            prior_claims,
        }))
    }

    async fn complete_run(
        &self,
        run_id: Uuid,
        worker: &str,
        prompt_id: Uuid,
        claims: &[ClaimDraft],
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let owned = sqlx::query_as::<_, (Uuid,)>(
            r#"
            SELECT r.investigation_id
            FROM investigation_runs r
            JOIN investigations i ON i.id = r.investigation_id
            WHERE r.id = $1 AND r.lease_owner = $2 AND i.status = 'PROCESSING'
            FOR UPDATE OF r, i
            "#,
        )
        .bind(run_id)
        .bind(worker)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((investigation_id,)) = owned else {
            tx.rollback().await?;
            return Ok(false);
        };

        for (index, draft) in claims.iter().enumerate() {
            let claim = Claim::from_draft(investigation_id, index as i32, draft, now);
            sqlx::query(
                r#"
                INSERT INTO claims (id, investigation_id, claim_index, text, context, summary, reasoning, sources, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(claim.id)
            .bind(claim.investigation_id)
            .bind(claim.claim_index)
            .bind(&claim.text)
            .bind(&claim.context)
            .bind(&claim.summary)
            .bind(&claim.reasoning)
            .bind(&claim.sources)
            .bind(claim.created_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "UPDATE investigations SET status = 'COMPLETE', prompt_id = $2, updated_at = $3 WHERE id = $1",
        )
        .bind(investigation_id)
        .bind(prompt_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE investigation_runs
            SET lease_owner = NULL, lease_expires_at = NULL, recover_after_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn fail_run(
        &self,
        run_id: Uuid,
        worker: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let failed = sqlx::query_as::<_, (Uuid,)>(
            r#"
            WITH owned AS (
                SELECT r.id AS run_id, i.id AS investigation_id
                FROM investigation_runs r
                JOIN investigations i ON i.id = r.investigation_id
                WHERE r.id = $1 AND r.lease_owner = $2 AND i.status = 'PROCESSING'
                FOR UPDATE OF r, i
            ),
            released AS (
                UPDATE investigation_runs r
                SET lease_owner = NULL, lease_expires_at = NULL, recover_after_at = NULL
                FROM owned o
                WHERE r.id = o.run_id
                RETURNING r.id
            )
            UPDATE investigations i
            SET status = 'FAILED', failure_reason = $3, updated_at = $4
            FROM owned o
            WHERE i.id = o.investigation_id
            RETURNING i.id
            "#,
        )
        .bind(run_id)
        .bind(worker)
        .bind(reason)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(failed.is_some())
    }

    async fn mark_retry_pending(
        &self,
        run_id: Uuid,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE investigation_runs SET recover_after_at = $3 WHERE id = $1 AND lease_owner = $2",
        )
        .bind(run_id)
        .bind(worker)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    async fn mark_recovery_due(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE investigation_runs r
            SET recover_after_at = $2
            FROM investigations i
            WHERE r.id = $1
              AND i.id = r.investigation_id
              AND i.status = 'PROCESSING'
              AND r.lease_owner IS NULL
            "#,
        )
        .bind(run_id)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }
}
