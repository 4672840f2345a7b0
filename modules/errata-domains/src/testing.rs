// Test doubles for the investigation pipeline.
//
// One in-memory implementation per trait boundary:
// - InMemoryRunStore (RunStore): mirrors the Postgres claim/lease predicates
// - InMemoryPromptStore (PromptStore): unique hash/version, with race hooks
// - InMemoryJobQueue (JobQueue + JobQueueConnector): keyed jobs, stale locks, attempt budget
// - InMemoryKeySourceStore (KeySourceStore): PENDING-guarded attach, delete-on-read,
//   optionally linked to an InMemoryRunStore
// - ScriptedResponses / ConcurrencyGauge (ResponsesApi): canned provider replies
// - StaticPageFetcher (PageFetcher): URL→text map
//
// Plus fixtures for responses and claims.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ai_client::{AiError, ResponseBody, ResponseRequest, ResponsesApi};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use errata_core::{content_hash, FetchError, FetchedPage, PageFetcher};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::credentials::{EncryptedKey, KeySourceStore, OpenAiKeySource};
use crate::investigations::{
    is_recoverable_processing_run_state, Claim, ClaimDraft, ClaimSource, Investigation,
    InvestigationRun, InvestigationStatus, RunContext, RunState, RunStore,
};
use crate::prompts::{Prompt, PromptStore};
use crate::queue::{
    EnqueueOutcome, FailResult, Job, JobQueue, JobQueueConnector, NewJob, QueueError, STALE_LOCK,
};
use crate::worker::ResponsesProvider;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Fixed epoch plus `ms` milliseconds.
pub fn at_ms(ms: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::milliseconds(ms)
}

// ---------------------------------------------------------------------------
// InMemoryRunStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RunTables {
    investigations: HashMap<Uuid, Investigation>,
    runs: HashMap<Uuid, InvestigationRun>,
    claims: Vec<Claim>,
}

/// Single-mutex store: every trait method is atomic, like the SQL statements
/// it stands in for.
#[derive(Default)]
pub struct InMemoryRunStore {
    tables: Mutex<RunTables>,
    failing_extends: AtomicUsize,
    failing_reset: Mutex<Option<Uuid>>,
}

/// A store holding one PENDING investigation; returns the run id.
pub fn seeded_store() -> (Arc<InMemoryRunStore>, Uuid) {
    let store = Arc::new(InMemoryRunStore::new());
    let (_, run) = store.add_investigation("The moon is made of cheese.", None);
    (store, run.id)
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_investigation(
        &self,
        content: &str,
        parent_investigation_id: Option<Uuid>,
    ) -> (Investigation, InvestigationRun) {
        let now = at_ms(0);
        let investigation = Investigation {
            id: Uuid::new_v4(),
            content: content.to_string(),
            content_hash: content_hash(content),
            status: InvestigationStatus::Pending,
            prompt_id: None,
            parent_investigation_id,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        let run = InvestigationRun::new(investigation.id, now);

        let mut tables = lock(&self.tables);
        tables
            .investigations
            .insert(investigation.id, investigation.clone());
        tables.runs.insert(run.id, run.clone());
        (investigation, run)
    }

    /// Attach already-approved claims to an investigation and mark it COMPLETE.
    pub fn complete_with_claims(&self, investigation_id: Uuid, drafts: &[ClaimDraft]) {
        let mut tables = lock(&self.tables);
        for (index, draft) in drafts.iter().enumerate() {
            let claim = Claim::from_draft(investigation_id, index as i32, draft, at_ms(0));
            tables.claims.push(claim);
        }
        if let Some(investigation) = tables.investigations.get_mut(&investigation_id) {
            investigation.status = InvestigationStatus::Complete;
        }
    }

    /// Make the next `n` lease extensions fail with a store error.
    pub fn fail_next_extends(&self, n: usize) {
        self.failing_extends.store(n, Ordering::SeqCst);
    }

    /// Flag the run as keyed if its investigation is still PENDING.
    pub fn flag_key_source(&self, run_id: Uuid) -> bool {
        let mut tables = lock(&self.tables);
        let Some(run) = tables.runs.get(&run_id) else {
            return false;
        };
        if Self::status_of(&tables, run) != Some(InvestigationStatus::Pending) {
            return false;
        }
        if let Some(run) = tables.runs.get_mut(&run_id) {
            run.key_source_attached = true;
        }
        true
    }

    /// Make the next recovery reset of `run_id` fail with a store error.
    pub fn fail_next_reset(&self, run_id: Uuid) {
        *lock(&self.failing_reset) = Some(run_id);
    }

    pub fn investigation_for_run(&self, run_id: Uuid) -> Option<Investigation> {
        let tables = lock(&self.tables);
        let run = tables.runs.get(&run_id)?;
        tables.investigations.get(&run.investigation_id).cloned()
    }

    pub fn claims(&self, investigation_id: Uuid) -> Vec<Claim> {
        lock(&self.tables)
            .claims
            .iter()
            .filter(|c| c.investigation_id == investigation_id)
            .cloned()
            .collect()
    }

    fn status_of(tables: &RunTables, run: &InvestigationRun) -> Option<InvestigationStatus> {
        tables
            .investigations
            .get(&run.investigation_id)
            .map(|i| i.status)
    }

    fn owned_processing(tables: &RunTables, run_id: Uuid, worker: &str) -> bool {
        tables.runs.get(&run_id).is_some_and(|run| {
            run.is_held_by(worker)
                && Self::status_of(tables, run) == Some(InvestigationStatus::Processing)
        })
    }

    fn release(tables: &mut RunTables, run_id: Uuid) {
        if let Some(run) = tables.runs.get_mut(&run_id) {
            run.lease_owner = None;
            run.lease_expires_at = None;
            run.recover_after_at = None;
        }
    }

    fn set_status(
        tables: &mut RunTables,
        run_id: Uuid,
        status: InvestigationStatus,
        now: DateTime<Utc>,
    ) -> Option<Uuid> {
        let investigation_id = tables.runs.get(&run_id)?.investigation_id;
        let investigation = tables.investigations.get_mut(&investigation_id)?;
        investigation.status = status;
        investigation.updated_at = now;
        Some(investigation_id)
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn try_claim(
        &self,
        run_id: Uuid,
        worker: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = lock(&self.tables);
        let Some(run) = tables.runs.get(&run_id) else {
            return Ok(false);
        };
        let claimable = match Self::status_of(&tables, run) {
            Some(InvestigationStatus::Pending) => true,
            Some(InvestigationStatus::Processing) => {
                run.lease_owner.is_none() || run.lease_expires_at.is_some_and(|t| t <= now)
            }
            _ => false,
        };
        if !claimable {
            return Ok(false);
        }

        Self::set_status(&mut tables, run_id, InvestigationStatus::Processing, now);
        if let Some(run) = tables.runs.get_mut(&run_id) {
            run.lease_owner = Some(worker.to_string());
            run.lease_expires_at = Some(lease_expires_at);
            run.recover_after_at = None;
            run.started_at = Some(now);
            run.heartbeat_at = Some(now);
        }
        Ok(true)
    }

    async fn find_run_state(&self, run_id: Uuid) -> Result<Option<RunState>> {
        let tables = lock(&self.tables);
        let Some(run) = tables.runs.get(&run_id) else {
            return Ok(None);
        };
        let status = Self::status_of(&tables, run).ok_or_else(|| anyhow!("orphaned run"))?;
        Ok(Some(RunState {
            run: run.clone(),
            status,
        }))
    }

    async fn extend_lease(
        &self,
        run_id: Uuid,
        worker: &str,
        now: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let failing = self.failing_extends.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_extends.store(failing - 1, Ordering::SeqCst);
            return Err(anyhow!("connection reset"));
        }

        let mut tables = lock(&self.tables);
        if !Self::owned_processing(&tables, run_id, worker) {
            return Ok(false);
        }
        if let Some(run) = tables.runs.get_mut(&run_id) {
            run.lease_expires_at = Some(lease_expires_at);
            run.heartbeat_at = Some(now);
        }
        Ok(true)
    }

    async fn list_processing_runs(&self) -> Result<Vec<InvestigationRun>> {
        let tables = lock(&self.tables);
        let mut runs: Vec<_> = tables
            .runs
            .values()
            .filter(|run| Self::status_of(&tables, run) == Some(InvestigationStatus::Processing))
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.queued_at);
        Ok(runs)
    }

    async fn reset_for_recovery(
        &self,
        run_id: Uuid,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        {
            let mut failing = lock(&self.failing_reset);
            if *failing == Some(run_id) {
                *failing = None;
                return Err(anyhow!("connection reset"));
            }
        }

        let mut tables = lock(&self.tables);
        let Some(run) = tables.runs.get(&run_id) else {
            return Ok(false);
        };
        if Self::status_of(&tables, run) != Some(InvestigationStatus::Processing)
            || !is_recoverable_processing_run_state(run, cutoff)
        {
            return Ok(false);
        }
        if let Some(run) = tables.runs.get_mut(&run_id) {
            run.lease_owner = None;
            run.lease_expires_at = None;
            run.recover_after_at = None;
            run.heartbeat_at = None;
            run.queued_at = now;
        }
        Ok(true)
    }

    async fn load_context(&self, run_id: Uuid) -> Result<Option<RunContext>> {
        let tables = lock(&self.tables);
        let Some(run) = tables.runs.get(&run_id) else {
            return Ok(None);
        };
        let investigation = tables
            .investigations
            .get(&run.investigation_id)
            .cloned()
            .ok_or_else(|| anyhow!("orphaned run"))?;
        let prior_claims = match investigation.parent_investigation_id {
            Some(parent) => tables
                .claims
                .iter()
                .filter(|c| c.investigation_id == parent)
                .map(Claim::to_draft)
                .collect(),
            None => Vec::new(),
        };
        Ok(Some(RunContext {
            run: run.clone(),
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
        let mut tables = lock(&self.tables);
        if !Self::owned_processing(&tables, run_id, worker) {
            return Ok(false);
        }
        let Some(investigation_id) =
            Self::set_status(&mut tables, run_id, InvestigationStatus::Complete, now)
        else {
            return Ok(false);
        };
        if let Some(investigation) = tables.investigations.get_mut(&investigation_id) {
            investigation.prompt_id = Some(prompt_id);
        }
        for (index, draft) in claims.iter().enumerate() {
            let claim = Claim::from_draft(investigation_id, index as i32, draft, now);
            tables.claims.push(claim);
        }
        Self::release(&mut tables, run_id);
        Ok(true)
    }

    async fn fail_run(
        &self,
        run_id: Uuid,
        worker: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = lock(&self.tables);
        if !Self::owned_processing(&tables, run_id, worker) {
            return Ok(false);
        }
        let Some(investigation_id) =
            Self::set_status(&mut tables, run_id, InvestigationStatus::Failed, now)
        else {
            return Ok(false);
        };
        if let Some(investigation) = tables.investigations.get_mut(&investigation_id) {
            investigation.failure_reason = Some(reason.to_string());
        }
        Self::release(&mut tables, run_id);
        Ok(true)
    }

    async fn mark_retry_pending(
        &self,
        run_id: Uuid,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = lock(&self.tables);
        match tables.runs.get_mut(&run_id) {
            Some(run) if run.is_held_by(worker) => {
                run.recover_after_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_recovery_due(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut tables = lock(&self.tables);
        let Some(run) = tables.runs.get(&run_id) else {
            return Ok(false);
        };
        if Self::status_of(&tables, run) != Some(InvestigationStatus::Processing)
            || run.lease_owner.is_some()
        {
            return Ok(false);
        }
        if let Some(run) = tables.runs.get_mut(&run_id) {
            run.recover_after_at = Some(now);
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// InMemoryPromptStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryPromptStore {
    prompts: Mutex<Vec<Prompt>>,
    /// Inserted just before the next `create`, simulating a concurrent creator.
    racer: Mutex<Option<(String, String)>>,
    fail_lookup: AtomicBool,
    created: AtomicUsize,
    hash_lookups: AtomicUsize,
}

impl InMemoryPromptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, version: &str, text: &str) -> Prompt {
        let prompt = Prompt {
            id: Uuid::new_v4(),
            hash: content_hash(text),
            version: version.to_string(),
            text: text.to_string(),
            created_at: at_ms(0),
        };
        lock(&self.prompts).push(prompt.clone());
        prompt
    }

    pub fn race_next_create(&self, version: &str, text: &str) {
        *lock(&self.racer) = Some((version.to_string(), text.to_string()));
    }

    pub fn fail_next_lookup(&self) {
        self.fail_lookup.store(true, Ordering::SeqCst);
    }

    /// Rows written through `create`.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn hash_lookups(&self) -> usize {
        self.hash_lookups.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        lock(&self.prompts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PromptStore for InMemoryPromptStore {
    async fn find_by_hash(&self, hash: &str) -> Result<Option<Prompt>> {
        self.hash_lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookup.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        // Give concurrent callers a chance to pile up on the first resolution.
        tokio::task::yield_now().await;
        Ok(lock(&self.prompts).iter().find(|p| p.hash == hash).cloned())
    }

    async fn find_by_version(&self, version: &str) -> Result<Option<Prompt>> {
        Ok(lock(&self.prompts)
            .iter()
            .find(|p| p.version == version)
            .cloned())
    }

    async fn create(&self, hash: &str, version: &str, text: &str) -> Result<Option<Prompt>> {
        if let Some((racer_version, racer_text)) = lock(&self.racer).take() {
            self.insert(&racer_version, &racer_text);
        }

        let mut prompts = lock(&self.prompts);
        if prompts.iter().any(|p| p.hash == hash || p.version == version) {
            return Ok(None);
        }
        let prompt = Prompt {
            id: Uuid::new_v4(),
            hash: hash.to_string(),
            version: version.to_string(),
            text: text.to_string(),
            created_at: at_ms(0),
        };
        prompts.push(prompt.clone());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Some(prompt))
    }
}

// ---------------------------------------------------------------------------
// InMemoryJobQueue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StoredJob {
    pub job: Job,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub run_at: DateTime<Utc>,
    pub failed: bool,
    pub last_error: Option<String>,
}

impl StoredJob {
    fn is_running(&self, now: DateTime<Utc>) -> bool {
        let stale_before = now - chrono::Duration::seconds(STALE_LOCK.as_secs() as i64);
        self.locked_at.is_some_and(|at| at >= stale_before)
    }

    fn unlock(&mut self) {
        self.locked_by = None;
        self.locked_at = None;
    }
}

/// Keyed job table with the same collapse, stale-lock and attempt rules as
/// the Postgres queue. Also acts as its own connector.
#[derive(Default)]
pub struct InMemoryJobQueue {
    jobs: Mutex<Vec<StoredJob>>,
    connects: AtomicUsize,
    shutdowns: AtomicUsize,
    fail_connect: AtomicBool,
    fail_shutdown: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(self: Arc<Self>) -> Arc<dyn JobQueueConnector> {
        Arc::new(InMemoryConnector(self))
    }

    pub fn job_keys(&self) -> Vec<String> {
        lock(&self.jobs).iter().map(|s| s.job.job_key.clone()).collect()
    }

    pub fn job(&self, job_key: &str) -> Option<StoredJob> {
        lock(&self.jobs)
            .iter()
            .find(|s| s.job.job_key == job_key)
            .cloned()
    }

    /// Backdate a job's lock, as if its holder took it `age` ago and died.
    pub fn age_lock(&self, job_key: &str, age: chrono::Duration) {
        if let Some(stored) = lock(&self.jobs).iter_mut().find(|s| s.job.job_key == job_key) {
            stored.locked_at = stored.locked_at.map(|at| at - age);
        }
    }

    fn push_new(jobs: &mut Vec<StoredJob>, job: NewJob) {
        jobs.push(StoredJob {
            job: Job {
                id: Uuid::new_v4(),
                job_key: job.job_key,
                task: job.task,
                payload: job.payload,
                attempts: 0,
                max_attempts: job.max_attempts,
            },
            locked_by: None,
            locked_at: None,
            run_at: Utc::now(),
            failed: false,
            last_error: None,
        });
    }

    /// Make a stored job due now, skipping its backoff.
    pub fn make_due(&self, job_key: &str) {
        if let Some(stored) = lock(&self.jobs).iter_mut().find(|s| s.job.job_key == job_key) {
            stored.run_at = Utc::now();
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn fail_next_connect(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn delay_connect(&self, delay: Duration) {
        *lock(&self.connect_delay) = Some(delay);
    }

    pub fn fail_shutdown(&self) {
        self.fail_shutdown.store(true, Ordering::SeqCst);
    }
}

struct InMemoryConnector(Arc<InMemoryJobQueue>);

#[async_trait]
impl JobQueueConnector for InMemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn JobQueue>, QueueError> {
        let delay = *lock(&self.0.connect_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.0.fail_connect.swap(false, Ordering::SeqCst) {
            return Err(QueueError::Connect("connection refused".into()));
        }
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.0.clone())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn add_job(&self, job: NewJob) -> Result<EnqueueOutcome, QueueError> {
        let now = Utc::now();
        let mut jobs = lock(&self.jobs);
        if let Some(stored) = jobs.iter_mut().find(|s| s.job.job_key == job.job_key) {
            if stored.is_running(now) {
                return Ok(EnqueueOutcome::AlreadyRunning);
            }
            stored.unlock();
            stored.job.payload = job.payload;
            stored.run_at = stored.run_at.min(now);
            stored.failed = false;
            stored.job.attempts = stored.job.attempts.min(stored.job.max_attempts - 1);
            return Ok(EnqueueOutcome::Merged);
        }

        Self::push_new(&mut jobs, job);
        Ok(EnqueueOutcome::Queued)
    }

    async fn replace_job(&self, job: NewJob) -> Result<EnqueueOutcome, QueueError> {
        let detached = {
            let mut jobs = lock(&self.jobs);
            match jobs
                .iter_mut()
                .find(|s| s.job.job_key == job.job_key && s.locked_at.is_some())
            {
                Some(stored) => {
                    stored.job.job_key = format!("{}:detached:{}", stored.job.job_key, stored.job.id);
                    stored.failed = true;
                    stored.last_error = Some("superseded by recovery".into());
                    true
                }
                None => false,
            }
        };

        let outcome = self.add_job(job).await?;
        Ok(if detached {
            EnqueueOutcome::Replaced
        } else {
            outcome
        })
    }

    async fn take_job(&self, worker: &str) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let mut jobs = lock(&self.jobs);
        let next = jobs
            .iter_mut()
            .filter(|s| {
                !s.failed
                    && !s.is_running(now)
                    && s.run_at <= now
                    && s.job.attempts < s.job.max_attempts
            })
            .min_by_key(|s| s.run_at);

        Ok(next.map(|stored| {
            stored.locked_by = Some(worker.to_string());
            stored.locked_at = Some(now);
            stored.job.attempts += 1;
            stored.job.clone()
        }))
    }

    async fn complete_job(&self, job: &Job) -> Result<(), QueueError> {
        lock(&self.jobs).retain(|s| s.job.id != job.id);
        Ok(())
    }

    async fn fail_job(&self, job: &Job, error: &str) -> Result<FailResult, QueueError> {
        let mut jobs = lock(&self.jobs);
        let stored = jobs
            .iter_mut()
            .find(|s| s.job.id == job.id)
            .ok_or_else(|| QueueError::Other(anyhow!("job {} not found", job.id)))?;

        stored.unlock();
        stored.last_error = Some(error.to_string());
        if job.is_final_attempt() {
            stored.failed = true;
            return Ok(FailResult::TerminalFailed {
                attempts: job.attempts,
            });
        }

        let delay_ms = crate::queue::job_queue::compute_retry_delay_ms(job.attempts);
        stored.run_at = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
        Ok(FailResult::Retried {
            attempts: job.attempts,
            delay_ms,
        })
    }

    async fn shutdown(&self) -> Result<(), QueueError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.fail_shutdown.load(Ordering::SeqCst) {
            return Err(QueueError::Other(anyhow!("pool close timed out")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InMemoryKeySourceStore
// ---------------------------------------------------------------------------

/// Standalone, it tracks PENDING runs itself. Linked to a run store, it
/// checks the investigation's status and flags the run there, like the
/// Postgres attach.
#[derive(Default)]
pub struct InMemoryKeySourceStore {
    sources: Mutex<HashMap<Uuid, OpenAiKeySource>>,
    pending_runs: Mutex<HashSet<Uuid>>,
    runs: Option<Arc<InMemoryRunStore>>,
}

impl InMemoryKeySourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn linked(runs: Arc<InMemoryRunStore>) -> Self {
        Self {
            runs: Some(runs),
            ..Self::default()
        }
    }

    /// A fresh run id whose investigation is PENDING.
    pub fn pending_run(&self) -> Uuid {
        let run_id = Uuid::new_v4();
        self.register_pending(run_id);
        run_id
    }

    pub fn register_pending(&self, run_id: Uuid) {
        lock(&self.pending_runs).insert(run_id);
    }

    /// The run's investigation leaves PENDING.
    pub fn start_run(&self, run_id: Uuid) {
        lock(&self.pending_runs).remove(&run_id);
    }

    pub fn len(&self) -> usize {
        lock(&self.sources).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeySourceStore for InMemoryKeySourceStore {
    async fn attach(
        &self,
        run_id: Uuid,
        sealed: &EncryptedKey,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let pending = match &self.runs {
            Some(runs) => runs.flag_key_source(run_id),
            None => lock(&self.pending_runs).contains(&run_id),
        };
        if !pending {
            return Ok(false);
        }
        lock(&self.sources).insert(
            run_id,
            OpenAiKeySource {
                id: Uuid::new_v4(),
                run_id,
                ciphertext: sealed.ciphertext.clone(),
                nonce: sealed.nonce.clone(),
                created_at: now,
                expires_at,
            },
        );
        Ok(true)
    }

    async fn consume(&self, run_id: Uuid) -> Result<Option<OpenAiKeySource>> {
        Ok(lock(&self.sources).remove(&run_id))
    }
}

// ---------------------------------------------------------------------------
// ScriptedResponses
// ---------------------------------------------------------------------------

/// Replays canned provider results in order and records every request.
/// Running out of script is a network error.
#[derive(Default)]
pub struct ScriptedResponses {
    script: Mutex<VecDeque<Result<ResponseBody, AiError>>>,
    requests: Mutex<Vec<ResponseRequest>>,
}

impl ScriptedResponses {
    pub fn new(responses: Vec<ResponseBody>) -> Self {
        Self::with_results(responses.into_iter().map(Ok).collect())
    }

    pub fn with_results(results: Vec<Result<ResponseBody, AiError>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ResponseRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl ResponsesApi for ScriptedResponses {
    async fn create_response(&self, request: &ResponseRequest) -> Result<ResponseBody, AiError> {
        lock(&self.requests).push(request.clone());
        lock(&self.script)
            .pop_front()
            .unwrap_or_else(|| Err(AiError::Network("script exhausted".into())))
    }
}

/// Provider double that serves one scripted API for every key and records
/// which per-run keys were requested.
pub struct ScriptedProvider {
    api: Arc<ScriptedResponses>,
    keys: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(api: Arc<ScriptedResponses>) -> Self {
        Self {
            api,
            keys: Mutex::new(Vec::new()),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.keys).clone()
    }
}

impl ResponsesProvider for ScriptedProvider {
    fn default_api(&self) -> Arc<dyn ResponsesApi> {
        self.api.clone()
    }

    fn with_api_key(&self, api_key: &str) -> Arc<dyn ResponsesApi> {
        lock(&self.keys).push(api_key.to_string());
        self.api.clone()
    }
}

// ---------------------------------------------------------------------------
// ConcurrencyGauge
// ---------------------------------------------------------------------------

/// Approves every claim after a delay while tracking peak concurrency.
pub struct ConcurrencyGauge {
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn approving(delay: Duration) -> Self {
        Self {
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResponsesApi for ConcurrencyGauge {
    async fn create_response(&self, _request: &ResponseRequest) -> Result<ResponseBody, AiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(completed_text(r#"{"approved":true,"reasoning":"confirmed"}"#))
    }
}

// ---------------------------------------------------------------------------
// StaticPageFetcher
// ---------------------------------------------------------------------------

/// URL→text map. Unknown URLs are reported as blocked.
#[derive(Default)]
pub struct StaticPageFetcher {
    pages: HashMap<String, String>,
}

impl StaticPageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, content: impl Into<String>) -> Self {
        self.pages.insert(url.to_string(), content.into());
        self
    }
}

#[async_trait]
impl PageFetcher for StaticPageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        match self.pages.get(url) {
            Some(content) => Ok(FetchedPage::new(url, content.clone()).with_title("Test page")),
            None => Err(FetchError::Blocked {
                url: url.to_string(),
                reason: "not in test fixture".into(),
            }),
        }
    }

    fn name(&self) -> &str {
        "static"
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn response(value: Value) -> ResponseBody {
    serde_json::from_value(value).expect("valid response fixture")
}

fn response_id() -> String {
    format!("resp_{}", Uuid::new_v4().simple())
}

/// Completed response whose assistant message is `text`.
pub fn completed_text(text: &str) -> ResponseBody {
    response(json!({
        "id": response_id(),
        "status": "completed",
        "output": [
            {"type": "web_search_call", "id": "ws_1", "status": "completed"},
            {"type": "message", "role": "assistant", "content": [
                {"type": "output_text", "text": text}
            ]}
        ]
    }))
}

/// Completed response asking for the given `(call_id, name, arguments)` calls.
pub fn function_call_response(calls: &[(&str, &str, Value)]) -> ResponseBody {
    let output: Vec<Value> = calls
        .iter()
        .enumerate()
        .map(|(i, (call_id, name, arguments))| {
            json!({
                "type": "function_call",
                "id": format!("fc_{i}"),
                "call_id": call_id,
                "name": name,
                "arguments": arguments.to_string(),
            })
        })
        .collect();
    response(json!({
        "id": response_id(),
        "status": "completed",
        "output": output,
    }))
}

pub fn incomplete_response(status: &str, reason: &str) -> ResponseBody {
    response(json!({
        "id": response_id(),
        "status": status,
        "incomplete_details": {"reason": reason},
        "output": []
    }))
}

pub fn sample_claim(i: usize) -> ClaimDraft {
    ClaimDraft {
        text: if i == 0 {
            "The moon is made of cheese".to_string()
        } else {
            format!("Claim number {i}")
        },
        context: "As everyone knows, the moon is made of cheese.".to_string(),
        summary: "The moon is made of rock.".to_string(),
        reasoning: "Lunar samples are silicate rock.".to_string(),
        sources: vec![ClaimSource {
            url: "https://a.example/facts".to_string(),
            title: Some("Moon facts".to_string()),
            snippet: None,
        }],
    }
}

pub fn sample_claims(n: usize) -> Vec<ClaimDraft> {
    (0..n).map(sample_claim).collect()
}

/// `{"claims": [...]}` with one sample claim.
pub fn sample_claim_json() -> String {
    json!({ "claims": [sample_claim(0)] }).to_string()
}
