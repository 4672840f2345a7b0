//! Integration tests for the Postgres stores and job queue.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use chrono::{Duration, Utc};
use errata_domains::credentials::{KeyCipher, KeySourceStore, PgKeySourceStore};
use errata_domains::investigations::{ClaimDraft, ClaimSource, PgRunStore};
use errata_domains::prompts::{PgPromptStore, PromptCache, PromptStore};
use errata_domains::queue::{EnqueueOutcome, FailResult, Job, JobQueue, NewJob, PgJobQueue};
use errata_domains::{InvestigationStatus, RunStore};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// Get a test database pool, or skip if no test DB is available.
async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;

    sqlx::raw_sql(include_str!(
        "../../../migrations/20260101000000_investigations.sql"
    ))
    .execute(&pool)
    .await
    .ok()?;

    Some(pool)
}

fn draft(text: &str) -> ClaimDraft {
    ClaimDraft {
        text: text.to_string(),
        context: "quoted from the post".to_string(),
        summary: "what is actually true".to_string(),
        reasoning: "checked against the source".to_string(),
        sources: vec![ClaimSource {
            url: "https://a.example/facts".to_string(),
            title: None,
            snippet: Some("relevant passage".to_string()),
        }],
    }
}

// =========================================================================
// Run leases
// =========================================================================

#[tokio::test]
async fn concurrent_claims_grant_exactly_one_lease() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = Arc::new(PgRunStore::new(pool));
    let now = Utc::now();
    let (_, run) = store
        .create_investigation("The moon is made of cheese.", None, now)
        .await
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .try_claim(run.id, &format!("w{i}"), now, now + Duration::seconds(60))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut granted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            granted += 1;
        }
    }
    assert_eq!(granted, 1);

    let state = store.find_run_state(run.id).await.unwrap().unwrap();
    assert_eq!(state.status, InvestigationStatus::Processing);
    assert!(state.run.lease_owner.is_some());
}

#[tokio::test]
async fn expired_lease_can_be_taken_over() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgRunStore::new(pool);
    let t0 = Utc::now() - Duration::seconds(120);
    let (_, run) = store.create_investigation("post", None, t0).await.unwrap();

    assert!(store
        .try_claim(run.id, "w1", t0, t0 + Duration::seconds(60))
        .await
        .unwrap());

    let now = Utc::now();
    assert!(!store
        .extend_lease(run.id, "w2", now, now + Duration::seconds(60))
        .await
        .unwrap());
    assert!(store
        .try_claim(run.id, "w2", now, now + Duration::seconds(60))
        .await
        .unwrap());
    assert!(!store
        .extend_lease(run.id, "w1", now, now + Duration::seconds(60))
        .await
        .unwrap());
    assert!(store
        .extend_lease(run.id, "w2", now, now + Duration::seconds(60))
        .await
        .unwrap());
}

#[tokio::test]
async fn complete_run_persists_claims_for_owner_only() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgRunStore::new(pool.clone());
    let prompts = PgPromptStore::new(pool);
    let prompt = prompts
        .create(&Uuid::new_v4().to_string(), &Uuid::new_v4().to_string(), "prompt")
        .await
        .unwrap()
        .unwrap();

    let now = Utc::now();
    let (investigation, run) = store.create_investigation("post", None, now).await.unwrap();
    store
        .try_claim(run.id, "w1", now, now + Duration::seconds(60))
        .await
        .unwrap();

    let claims = vec![draft("first"), draft("second")];
    assert!(!store
        .complete_run(run.id, "w2", prompt.id, &claims, now)
        .await
        .unwrap());
    assert!(store
        .complete_run(run.id, "w1", prompt.id, &claims, now)
        .await
        .unwrap());

    let saved = store.find_claims(investigation.id).await.unwrap();
    assert_eq!(saved.len(), 2);
    assert_eq!(saved[0].claim_index, 0);
    assert_eq!(saved[1].text, "second");
    assert_eq!(saved[0].sources.0[0].url, "https://a.example/facts");

    let state = store.find_run_state(run.id).await.unwrap().unwrap();
    assert_eq!(state.status, InvestigationStatus::Complete);
    assert!(state.run.lease_owner.is_none());

    let (child, child_run) = store
        .create_investigation("edited post", Some(investigation.id), now)
        .await
        .unwrap();
    let context = store.load_context(child_run.id).await.unwrap().unwrap();
    assert_eq!(context.investigation.id, child.id);
    assert_eq!(context.prior_claims.len(), 2);
}

#[tokio::test]
async fn stale_processing_run_is_reset_for_recovery() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgRunStore::new(pool);
    let t0 = Utc::now() - Duration::seconds(300);
    let (_, run) = store.create_investigation("post", None, t0).await.unwrap();
    store
        .try_claim(run.id, "w1", t0, t0 + Duration::seconds(60))
        .await
        .unwrap();

    let processing = store.list_processing_runs().await.unwrap();
    assert!(processing.iter().any(|r| r.id == run.id));

    let now = Utc::now();
    // A cutoff before the lease expiry leaves it alone.
    assert!(!store
        .reset_for_recovery(run.id, t0, now)
        .await
        .unwrap());
    assert!(store
        .reset_for_recovery(run.id, now - Duration::seconds(60), now)
        .await
        .unwrap());

    let state = store.find_run_state(run.id).await.unwrap().unwrap();
    assert_eq!(state.status, InvestigationStatus::Processing);
    assert!(state.run.lease_owner.is_none());
    assert!(state.run.lease_expires_at.is_none());
    assert!(store
        .try_claim(run.id, "w2", now, now + Duration::seconds(60))
        .await
        .unwrap());
}

#[tokio::test]
async fn fail_run_records_reason() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgRunStore::new(pool);
    let now = Utc::now();
    let (_, run) = store.create_investigation("post", None, now).await.unwrap();
    store
        .try_claim(run.id, "w1", now, now + Duration::seconds(60))
        .await
        .unwrap();

    assert!(store
        .mark_retry_pending(run.id, "w1", now)
        .await
        .unwrap());
    assert!(store
        .fail_run(run.id, "w1", "HTTP 401", now)
        .await
        .unwrap());

    let context = store.load_context(run.id).await.unwrap().unwrap();
    assert_eq!(context.investigation.status, InvestigationStatus::Failed);
    assert_eq!(context.investigation.failure_reason.as_deref(), Some("HTTP 401"));
    assert!(context.run.lease_owner.is_none());
}

// =========================================================================
// Prompts
// =========================================================================

#[tokio::test]
async fn concurrent_caches_resolve_one_prompt_row() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let version = format!("test-{}", Uuid::new_v4());
    let text = format!("Investigate carefully. {version}");
    let store: Arc<dyn PromptStore> = Arc::new(PgPromptStore::new(pool));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let cache = PromptCache::with_text(store.clone(), version.clone(), text.clone());
            tokio::spawn(async move { cache.get_or_create_current_prompt().await.unwrap() })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);

    let row = store.find_by_version(&version).await.unwrap().unwrap();
    assert_eq!(row.id, ids[0]);
}

// =========================================================================
// Per-run keys
// =========================================================================

#[tokio::test]
async fn key_attaches_only_while_pending_and_is_consumed_once() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let runs = PgRunStore::new(pool.clone());
    let keys = PgKeySourceStore::new(pool);
    let cipher = KeyCipher::new(&[3u8; 32]);
    let sealed = cipher.encrypt("sk-test").unwrap();

    let now = Utc::now();
    let (_, run) = runs.create_investigation("post", None, now).await.unwrap();
    assert!(keys
        .attach(run.id, &sealed, now, now + Duration::minutes(30))
        .await
        .unwrap());
    let state = runs.find_run_state(run.id).await.unwrap().unwrap();
    assert!(state.run.key_source_attached);

    let source = keys.consume(run.id).await.unwrap().unwrap();
    assert_eq!(cipher.decrypt(&source.sealed()).unwrap(), "sk-test");
    assert!(keys.consume(run.id).await.unwrap().is_none());

    runs.try_claim(run.id, "w1", now, now + Duration::seconds(60))
        .await
        .unwrap();
    assert!(!keys
        .attach(run.id, &sealed, now, now + Duration::minutes(30))
        .await
        .unwrap());
}

// =========================================================================
// Job queue
// =========================================================================

#[tokio::test]
async fn jobs_collapse_on_key_and_back_off_on_failure() {
    let Some(pool) = test_pool().await else {
        return;
    };
    sqlx::query("DELETE FROM investigation_jobs WHERE job_key LIKE 'investigate-run:' || $1 || '%'")
        .bind(Uuid::nil().to_string())
        .execute(&pool)
        .await
        .unwrap();
    let queue = PgJobQueue::with_pool(pool);
    let new_job = || NewJob {
        job_key: format!("investigate-run:{}", Uuid::nil()),
        task: "investigate".into(),
        payload: serde_json::json!({ "runId": Uuid::nil() }),
        max_attempts: 3,
    };

    assert_eq!(queue.add_job(new_job()).await.unwrap(), EnqueueOutcome::Queued);
    assert_eq!(queue.add_job(new_job()).await.unwrap(), EnqueueOutcome::Merged);

    let job = queue.take_job("w1").await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert!(queue.take_job("w2").await.unwrap().is_none());
    assert_eq!(
        queue.add_job(new_job()).await.unwrap(),
        EnqueueOutcome::AlreadyRunning
    );

    match queue.fail_job(&job, "HTTP 500").await.unwrap() {
        FailResult::Retried { attempts, delay_ms } => {
            assert_eq!(attempts, 1);
            assert_eq!(delay_ms, 60_000);
        }
        other => panic!("unexpected {other:?}"),
    }
    // Backed off: not due yet.
    assert!(queue.take_job("w2").await.unwrap().is_none());

    queue.complete_job(&job).await.unwrap();
    assert_eq!(queue.add_job(new_job()).await.unwrap(), EnqueueOutcome::Queued);
}

#[tokio::test]
async fn replacing_a_locked_job_detaches_it() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let run_id = Uuid::new_v4();
    let key = format!("investigate-run:{run_id}");
    let queue = PgJobQueue::with_pool(pool.clone());
    let new_job = || NewJob {
        job_key: key.clone(),
        task: "investigate".into(),
        payload: serde_json::json!({ "runId": run_id }),
        max_attempts: 3,
    };

    assert_eq!(queue.replace_job(new_job()).await.unwrap(), EnqueueOutcome::Queued);

    // Lock it the way take_job does, by key so parallel tests stay out of the way.
    let held = sqlx::query_as::<_, Job>(
        r#"
        UPDATE investigation_jobs
        SET locked_at = NOW(), locked_by = 'w1', attempts = attempts + 1
        WHERE job_key = $1
        RETURNING id, job_key, task, payload, attempts, max_attempts
        "#,
    )
    .bind(&key)
    .fetch_one(&pool)
    .await
    .unwrap();

    assert_eq!(
        queue.add_job(new_job()).await.unwrap(),
        EnqueueOutcome::AlreadyRunning
    );
    assert_eq!(
        queue.replace_job(new_job()).await.unwrap(),
        EnqueueOutcome::Replaced
    );

    let (fresh_id, attempts, locked): (Uuid, i32, bool) = sqlx::query_as(
        "SELECT id, attempts, locked_at IS NOT NULL FROM investigation_jobs WHERE job_key = $1",
    )
    .bind(&key)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_ne!(fresh_id, held.id);
    assert_eq!(attempts, 0);
    assert!(!locked);

    // A late retry from the old holder does not revive the detached row.
    queue.fail_job(&held, "worker came back").await.unwrap();
    let (detached_key, failed): (String, bool) = sqlx::query_as(
        "SELECT job_key, failed_at IS NOT NULL FROM investigation_jobs WHERE id = $1",
    )
    .bind(held.id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(detached_key, format!("{key}:detached:{}", held.id));
    assert!(failed);
}
