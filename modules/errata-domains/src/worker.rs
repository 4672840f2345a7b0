//! Queue consumer that drives one investigation run end to end.

use ai_client::{OpenAi, ResponsesApi};
use anyhow::{anyhow, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::credentials::{CredentialResolver, RunCredential};
use crate::errors::{classify, Classification, StageError};
use crate::findings::validator::approved_claims;
use crate::findings::{ClaimValidator, InvestigationInput, InvestigationOrchestrator};
use crate::investigations::{ClaimOutcome, RunLeaseManager};
use crate::prompts::PromptCache;
use crate::queue::{FailResult, Job, QueueAdapter};

/// Hands out a provider client, either on the process-wide key or on a
/// per-run key.
pub trait ResponsesProvider: Send + Sync {
    fn default_api(&self) -> Arc<dyn ResponsesApi>;

    fn with_api_key(&self, api_key: &str) -> Arc<dyn ResponsesApi>;
}

impl ResponsesProvider for OpenAi {
    fn default_api(&self) -> Arc<dyn ResponsesApi> {
        Arc::new(self.clone())
    }

    fn with_api_key(&self, api_key: &str) -> Arc<dyn ResponsesApi> {
        Arc::new(OpenAi::with_api_key(self, api_key))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed {
        run_id: Uuid,
        candidates: usize,
        approved: usize,
    },
    /// Claim was not granted; nothing to do for this delivery.
    Skipped {
        run_id: Uuid,
        claim: ClaimOutcome,
    },
    /// Results were produced but another worker owns the run by now.
    LeaseLost { run_id: Uuid },
    /// Run marked FAILED.
    Failed {
        run_id: Uuid,
        classification: Classification,
    },
    /// Handed back to the queue for another attempt.
    Retrying {
        run_id: Uuid,
        classification: Classification,
    },
    /// Payload did not name a run.
    Discarded { job_key: String },
}

struct RunResult {
    accepted: bool,
    candidates: usize,
    approved: usize,
}

#[derive(TypedBuilder)]
pub struct InvestigationWorker {
    #[builder(setter(into))]
    worker_id: String,
    leases: RunLeaseManager,
    queue: Arc<QueueAdapter>,
    prompts: Arc<PromptCache>,
    credentials: Arc<CredentialResolver>,
    provider: Arc<dyn ResponsesProvider>,
    orchestrator: Arc<InvestigationOrchestrator>,
    validator: Arc<ClaimValidator>,
    #[builder(default = Duration::from_secs(15))]
    heartbeat_interval: Duration,
    #[builder(default = Duration::from_secs(1))]
    poll_interval: Duration,
}

impl InvestigationWorker {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Poll and process jobs until `shutdown` resolves. A run in progress is
    /// finished before the loop exits; the queue is closed on the way out.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        info!(worker = %self.worker_id, "Investigation worker started");

        loop {
            let job = tokio::select! {
                _ = &mut shutdown => break,
                job = self.next_job() => job,
            };
            if let Some(job) = job {
                self.process_job(job).await;
            }
        }

        info!(worker = %self.worker_id, "Investigation worker stopping");
        self.queue.close().await?;
        Ok(())
    }

    async fn next_job(&self) -> Option<Job> {
        let taken = match self.queue.queue().await {
            Ok(queue) => queue.take_job(&self.worker_id).await,
            Err(e) => Err(e),
        };
        match taken {
            Ok(Some(job)) => return Some(job),
            Ok(None) => {}
            Err(e) => warn!(worker = %self.worker_id, error = %e, "Failed to take job"),
        }
        tokio::time::sleep(self.poll_interval).await;
        None
    }

    /// Process one delivery and settle it with the queue.
    pub async fn process_job(&self, job: Job) -> JobOutcome {
        let outcome = self.handle_job(&job).await;

        let settled = match &outcome {
            JobOutcome::Retrying { classification, .. } => {
                self.fail_job(&job, &classification.message).await
            }
            _ => self.complete_job(&job).await,
        };
        if let Err(e) = settled {
            error!(job_key = %job.job_key, error = %e, "Failed to settle job");
        }

        outcome
    }

    async fn handle_job(&self, job: &Job) -> JobOutcome {
        let Some(run_id) = job
            .payload
            .get("runId")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
        else {
            error!(job_key = %job.job_key, payload = %job.payload, "Job payload has no valid runId");
            return JobOutcome::Discarded {
                job_key: job.job_key.clone(),
            };
        };

        let claim = match self.leases.claim(run_id, &self.worker_id).await {
            Ok(claim) => claim,
            Err(e) => return self.handle_failure(job, run_id, StageError::new("claim", e).into()).await,
        };
        if claim != ClaimOutcome::Claimed {
            info!(run_id = %run_id, outcome = claim.as_str(), "Skipping delivery");
            return JobOutcome::Skipped { run_id, claim };
        }

        let heartbeat =
            self.leases
                .start_heartbeat(run_id, &self.worker_id, self.heartbeat_interval);
        let result = self.execute_run(run_id).await;
        heartbeat.stop().await;

        match result {
            Ok(RunResult {
                accepted: true,
                candidates,
                approved,
            }) => {
                info!(run_id = %run_id, candidates, approved, "Investigation complete");
                JobOutcome::Completed {
                    run_id,
                    candidates,
                    approved,
                }
            }
            Ok(RunResult { accepted: false, .. }) => {
                warn!(run_id = %run_id, worker = %self.worker_id, "Lease lost before results were saved; discarding them");
                JobOutcome::LeaseLost { run_id }
            }
            Err(e) => self.handle_failure(job, run_id, e).await,
        }
    }

    async fn execute_run(&self, run_id: Uuid) -> Result<RunResult> {
        let store = self.leases.store();
        let clock = self.leases.clock();

        let context = store
            .load_context(run_id)
            .await
            .and_then(|c| c.ok_or_else(|| anyhow!("run {run_id} not found after claim")))
            .map_err(|e| StageError::new("load_context", e))?;

        let api = match self
            .credentials
            .resolve(&context.run, clock.now())
            .await
            .map_err(|e| StageError::new("credentials", e))?
        {
            RunCredential::Default => self.provider.default_api(),
            RunCredential::PerRun(key) => self.provider.with_api_key(&key),
        };

        let prompt_id = self
            .prompts
            .get_or_create_current_prompt()
            .await
            .map_err(|e| StageError::new("prompt", e))?;

        let session = self
            .orchestrator
            .investigate(
                api.as_ref(),
                self.prompts.text(),
                InvestigationInput {
                    content: &context.investigation.content,
                    prior_claims: &context.prior_claims,
                },
            )
            .await
            .map_err(|e| StageError::new("investigate", e))?;

        let results = self
            .validator
            .validate(api.as_ref(), &context.investigation.content, &session.claims)
            .await;
        let approved = approved_claims(&session.claims, &results);

        let accepted = store
            .complete_run(run_id, &self.worker_id, prompt_id, &approved, clock.now())
            .await
            .map_err(|e| StageError::new("persist", e))?;

        Ok(RunResult {
            accepted,
            candidates: session.claims.len(),
            approved: approved.len(),
        })
    }

    async fn handle_failure(&self, job: &Job, run_id: Uuid, err: anyhow::Error) -> JobOutcome {
        let classification = classify(&err);
        let store = self.leases.store();
        let now = self.leases.clock().now();

        if classification.is_terminal() || job.is_final_attempt() {
            error!(
                run_id = %run_id,
                stage = classification.stage.unwrap_or("-"),
                kind = ?classification.kind,
                attempt = job.attempts,
                error = %classification.message,
                "Investigation failed"
            );
            if let Err(e) = store
                .fail_run(run_id, &self.worker_id, &classification.message, now)
                .await
            {
                error!(run_id = %run_id, error = %e, "Failed to mark run FAILED");
            }
            return JobOutcome::Failed {
                run_id,
                classification,
            };
        }

        warn!(
            run_id = %run_id,
            stage = classification.stage.unwrap_or("-"),
            kind = ?classification.kind,
            attempt = job.attempts,
            error = %classification.message,
            "Investigation failed, will retry"
        );
        if let Err(e) = store.mark_retry_pending(run_id, &self.worker_id, now).await {
            warn!(run_id = %run_id, error = %e, "Failed to flag run for recovery");
        }
        JobOutcome::Retrying {
            run_id,
            classification,
        }
    }

    async fn complete_job(&self, job: &Job) -> Result<()> {
        self.queue.queue().await?.complete_job(job).await?;
        Ok(())
    }

    async fn fail_job(&self, job: &Job, message: &str) -> Result<()> {
        match self.queue.queue().await?.fail_job(job, message).await? {
            FailResult::Retried { delay_ms, .. } => {
                info!(job_key = %job.job_key, attempt = job.attempts, delay_ms, "Job rescheduled");
            }
            FailResult::TerminalFailed { attempts } => {
                warn!(job_key = %job.job_key, attempts, "Job out of attempts");
            }
        }
        Ok(())
    }
}
