use anyhow::Result;
use chrono::Duration;
use tracing::{error, info, warn};

use super::lease::{is_recoverable_processing_run_state, RunLeaseManager};
use crate::queue::QueueAdapter;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// PROCESSING runs inspected.
    pub scanned: usize,
    /// Runs reset and handed back to the queue.
    pub recovered: usize,
    /// Runs reset whose re-enqueue failed. They are flagged for the next pass.
    pub enqueue_failures: usize,
    /// Runs skipped because the reset itself errored.
    pub store_failures: usize,
}

impl RunLeaseManager {
    /// One recovery pass. A run is recycled once its lease expired, or its
    /// retry flag came due, more than `grace` ago.
    ///
    /// A heartbeat landing between the scan and the reset is caught by the
    /// reset's own predicate re-check. A worker that stalls past the grace
    /// period and then resumes can still race the next claimer.
    pub async fn recover_stale_runs(
        &self,
        queue: &QueueAdapter,
        grace: Duration,
    ) -> Result<RecoveryReport> {
        let now = self.clock().now();
        let cutoff = now - grace;
        let runs = self.store().list_processing_runs().await?;

        let mut report = RecoveryReport {
            scanned: runs.len(),
            ..Default::default()
        };

        for run in runs
            .iter()
            .filter(|run| is_recoverable_processing_run_state(run, cutoff))
        {
            match self.store().reset_for_recovery(run.id, cutoff, now).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!(run_id = %run.id, error = %e, "Failed to reset stale run");
                    report.store_failures += 1;
                    continue;
                }
            }

            match queue.requeue(run.id).await {
                Ok(outcome) => {
                    info!(
                        run_id = %run.id,
                        previous_owner = run.lease_owner.as_deref().unwrap_or("-"),
                        ?outcome,
                        "Recovered stale run"
                    );
                    report.recovered += 1;
                }
                Err(e) => {
                    error!(run_id = %run.id, error = %e, "Recovered run could not be re-enqueued");
                    report.enqueue_failures += 1;
                    // The reset cleared the recovery fields; re-flag for the next pass.
                    if let Err(e) = self.store().mark_recovery_due(run.id, now).await {
                        warn!(run_id = %run.id, error = %e, "Failed to flag run for next sweep");
                    }
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::investigations::{ClaimOutcome, RunStore};
    use crate::queue::{job_key, EnqueueOutcome, JobQueue};
    use crate::testing::{at_ms, seeded_store, InMemoryJobQueue, InMemoryRunStore};
    use errata_core::ManualClock;
    use std::sync::Arc;

    const TTL: i64 = 60_000;
    const GRACE: i64 = 60_000;

    #[tokio::test]
    async fn abandoned_run_is_reset_and_requeued_after_grace() {
        let (store, run_id) = seeded_store();
        let clock = Arc::new(ManualClock::at(at_ms(0)));
        let leases =
            RunLeaseManager::new(store.clone(), clock.clone(), Duration::milliseconds(TTL));
        let jobs = Arc::new(InMemoryJobQueue::new());
        let queue = QueueAdapter::new(jobs.clone().connector(), 4);

        assert_eq!(leases.claim(run_id, "w1").await.unwrap(), ClaimOutcome::Claimed);

        // Lease expired 30s ago: inside the grace period.
        clock.set(at_ms(TTL + 30_000));
        let report = leases
            .recover_stale_runs(&queue, Duration::milliseconds(GRACE))
            .await
            .unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.recovered, 0);

        clock.set(at_ms(TTL + GRACE + 1_000));
        let report = leases
            .recover_stale_runs(&queue, Duration::milliseconds(GRACE))
            .await
            .unwrap();
        assert_eq!(report.recovered, 1);

        let state = store.find_run_state(run_id).await.unwrap().unwrap();
        assert_eq!(state.run.lease_owner, None);
        assert_eq!(state.run.lease_expires_at, None);
        assert_eq!(state.run.heartbeat_at, None);
        assert_eq!(state.run.queued_at, at_ms(TTL + GRACE + 1_000));
        assert_eq!(jobs.job_keys(), vec![format!("investigate-run:{run_id}")]);

        // Reset runs are claimable again.
        assert_eq!(leases.claim(run_id, "w2").await.unwrap(), ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn live_lease_is_left_alone() {
        let (store, run_id) = seeded_store();
        let clock = Arc::new(ManualClock::at(at_ms(0)));
        let leases =
            RunLeaseManager::new(store.clone(), clock.clone(), Duration::milliseconds(TTL));
        let jobs = Arc::new(InMemoryJobQueue::new());
        let queue = QueueAdapter::new(jobs.clone().connector(), 4);

        assert_eq!(leases.claim(run_id, "w1").await.unwrap(), ClaimOutcome::Claimed);
        clock.set(at_ms(TTL - 5_000));

        let report = leases
            .recover_stale_runs(&queue, Duration::milliseconds(GRACE))
            .await
            .unwrap();
        assert_eq!(report.recovered, 0);
        assert!(jobs.job_keys().is_empty());
        assert!(store.find_run_state(run_id).await.unwrap().unwrap().run.is_held_by("w1"));
    }

    #[tokio::test]
    async fn retry_flag_makes_run_recoverable_before_lease_expiry() {
        let (store, run_id) = seeded_store();
        let clock = Arc::new(ManualClock::at(at_ms(0)));
        let leases =
            RunLeaseManager::new(store.clone(), clock.clone(), Duration::milliseconds(TTL));
        let jobs = Arc::new(InMemoryJobQueue::new());
        let queue = QueueAdapter::new(jobs.clone().connector(), 4);

        assert_eq!(leases.claim(run_id, "w1").await.unwrap(), ClaimOutcome::Claimed);
        assert!(store.mark_retry_pending(run_id, "w1", at_ms(1_000)).await.unwrap());

        // At the cutoff the lease is still live but the retry flag is due.
        clock.set(at_ms(GRACE + 2_000));

        let report = leases
            .recover_stale_runs(&queue, Duration::milliseconds(GRACE))
            .await
            .unwrap();
        assert_eq!(report.recovered, 1);
        jobs.take_job("w9").await.unwrap().expect("requeued job");
    }

    #[tokio::test]
    async fn failed_requeue_is_retried_by_next_sweep() {
        let (store, run_id) = seeded_store();
        let clock = Arc::new(ManualClock::at(at_ms(0)));
        let leases =
            RunLeaseManager::new(store.clone(), clock.clone(), Duration::milliseconds(TTL));
        let jobs = Arc::new(InMemoryJobQueue::new());
        let queue = QueueAdapter::new(jobs.clone().connector(), 4);

        assert_eq!(leases.claim(run_id, "w1").await.unwrap(), ClaimOutcome::Claimed);
        jobs.fail_next_connect();

        let swept_at = TTL + GRACE + 1_000;
        clock.set(at_ms(swept_at));
        let report = leases
            .recover_stale_runs(&queue, Duration::milliseconds(GRACE))
            .await
            .unwrap();
        assert_eq!(report.recovered, 0);
        assert_eq!(report.enqueue_failures, 1);
        assert!(jobs.job_keys().is_empty());

        let state = store.find_run_state(run_id).await.unwrap().unwrap();
        assert_eq!(state.run.lease_owner, None);
        assert_eq!(state.run.recover_after_at, Some(at_ms(swept_at)));

        // Still inside the grace period of the re-flag.
        clock.set(at_ms(swept_at + GRACE - 1_000));
        let report = leases
            .recover_stale_runs(&queue, Duration::milliseconds(GRACE))
            .await
            .unwrap();
        assert_eq!(report.recovered, 0);

        clock.set(at_ms(swept_at + GRACE + 1_000));
        let report = leases
            .recover_stale_runs(&queue, Duration::milliseconds(GRACE))
            .await
            .unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.enqueue_failures, 0);
        assert_eq!(jobs.job_keys(), vec![job_key(run_id)]);

        let state = store.find_run_state(run_id).await.unwrap().unwrap();
        assert_eq!(state.run.recover_after_at, None);
    }

    #[tokio::test]
    async fn job_locked_by_crashed_worker_is_replaced() {
        let (store, run_id) = seeded_store();
        let clock = Arc::new(ManualClock::at(at_ms(0)));
        let leases =
            RunLeaseManager::new(store.clone(), clock.clone(), Duration::milliseconds(TTL));
        let jobs = Arc::new(InMemoryJobQueue::new());
        let queue = QueueAdapter::new(jobs.clone().connector(), 4);

        // w1 takes the job, claims the run, then dies without settling either.
        queue.enqueue(run_id).await.unwrap();
        let orphaned = jobs.take_job("w1").await.unwrap().unwrap();
        assert_eq!(leases.claim(run_id, "w1").await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            queue.enqueue(run_id).await.unwrap(),
            EnqueueOutcome::AlreadyRunning
        );

        clock.set(at_ms(TTL + GRACE + 1_000));
        let report = leases
            .recover_stale_runs(&queue, Duration::milliseconds(GRACE))
            .await
            .unwrap();
        assert_eq!(report.recovered, 1);

        let fresh = jobs.take_job("w2").await.unwrap().expect("replacement job");
        assert_ne!(fresh.id, orphaned.id);
        assert_eq!(fresh.job_key, job_key(run_id));
        assert_eq!(fresh.attempts, 1);
        assert_eq!(leases.claim(run_id, "w2").await.unwrap(), ClaimOutcome::Claimed);

        // The detached job never comes back, even once its lock goes stale.
        let detached_key = format!("{}:detached:{}", job_key(run_id), orphaned.id);
        jobs.age_lock(&detached_key, Duration::hours(1));
        assert!(jobs.take_job("w3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reset_error_skips_only_that_run() {
        let store = Arc::new(InMemoryRunStore::new());
        let (_, first) = store.add_investigation("first post", None);
        let (_, second) = store.add_investigation("second post", None);
        let clock = Arc::new(ManualClock::at(at_ms(0)));
        let leases =
            RunLeaseManager::new(store.clone(), clock.clone(), Duration::milliseconds(TTL));
        let jobs = Arc::new(InMemoryJobQueue::new());
        let queue = QueueAdapter::new(jobs.clone().connector(), 4);

        leases.claim(first.id, "w1").await.unwrap();
        leases.claim(second.id, "w1").await.unwrap();
        store.fail_next_reset(first.id);

        clock.set(at_ms(TTL + GRACE + 1_000));
        let report = leases
            .recover_stale_runs(&queue, Duration::milliseconds(GRACE))
            .await
            .unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.store_failures, 1);
        assert_eq!(report.recovered, 1);
        assert_eq!(jobs.job_keys(), vec![job_key(second.id)]);

        // The untouched run is picked up by the next pass.
        let report = leases
            .recover_stale_runs(&queue, Duration::milliseconds(GRACE))
            .await
            .unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.store_failures, 0);
    }
}
