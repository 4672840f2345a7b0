use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use errata_core::Clock;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::models::investigation_run::InvestigationRun;
use super::store::RunStore;

/// Result of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// No run with that id.
    Missing,
    /// The investigation is already COMPLETE or FAILED.
    Terminal,
    /// Another worker holds a live lease.
    LeaseHeld,
}

impl ClaimOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claimed => "CLAIMED",
            Self::Missing => "MISSING",
            Self::Terminal => "TERMINAL",
            Self::LeaseHeld => "LEASE_HELD",
        }
    }
}

/// True iff the lease has expired or the run was flagged for recovery,
/// both evaluated at `now`.
pub fn is_recoverable_processing_run_state(run: &InvestigationRun, now: DateTime<Utc>) -> bool {
    let lease_expired = run.lease_expires_at.is_some_and(|t| t <= now);
    let recovery_due = run.recover_after_at.is_some_and(|t| t <= now);
    lease_expired || recovery_due
}

/// Exclusive, time-bounded ownership of investigation runs. The store's
/// conditional update is the only mutual-exclusion primitive; there is no
/// in-process coordination between workers.
#[derive(Clone)]
pub struct RunLeaseManager {
    store: Arc<dyn RunStore>,
    clock: Arc<dyn Clock>,
    lease_ttl: Duration,
}

impl RunLeaseManager {
    pub fn new(store: Arc<dyn RunStore>, clock: Arc<dyn Clock>, lease_ttl: Duration) -> Self {
        Self {
            store,
            clock,
            lease_ttl,
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    pub async fn claim(&self, run_id: Uuid, worker: &str) -> Result<ClaimOutcome> {
        let now = self.clock.now();
        if self
            .store
            .try_claim(run_id, worker, now, now + self.lease_ttl)
            .await?
        {
            info!(run_id = %run_id, worker = %worker, "Run claimed");
            return Ok(ClaimOutcome::Claimed);
        }

        // The write is authoritative; this read only explains the miss.
        let outcome = match self.store.find_run_state(run_id).await? {
            None => ClaimOutcome::Missing,
            Some(state) if state.status.is_terminal() => ClaimOutcome::Terminal,
            Some(_) => ClaimOutcome::LeaseHeld,
        };
        debug!(run_id = %run_id, worker = %worker, outcome = outcome.as_str(), "Claim not granted");
        Ok(outcome)
    }

    /// One heartbeat tick. `false` means this worker no longer owns the run.
    pub async fn extend(&self, run_id: Uuid, worker: &str) -> Result<bool> {
        let now = self.clock.now();
        self.store
            .extend_lease(run_id, worker, now, now + self.lease_ttl)
            .await
    }
}
