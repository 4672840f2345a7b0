//! End-to-end worker behavior against the in-memory stores.

use std::sync::Arc;
use std::time::Duration;

use ai_client::AiError;
use errata_core::ManualClock;
use errata_domains::credentials::{CredentialResolver, KeyCipher};
use errata_domains::findings::{ClaimValidator, InvestigationOrchestrator};
use errata_domains::investigations::InvestigationStatus;
use errata_domains::queue::{job_key, JobQueue, NewJob};
use errata_domains::testing::{
    at_ms, completed_text, sample_claim_json, InMemoryJobQueue, InMemoryKeySourceStore,
    InMemoryPromptStore, InMemoryRunStore, ScriptedProvider, ScriptedResponses,
    StaticPageFetcher,
};
use errata_domains::{
    ClaimOutcome, ErrorKind, InvestigationWorker, JobOutcome, PromptCache, QueueAdapter,
    RunLeaseManager, RunStore,
};
use uuid::Uuid;

const LEASE_TTL_MS: i64 = 60_000;
const KEY_TTL_MS: i64 = 30 * 60 * 1000;
const APPROVE: &str = r#"{"approved":true,"reasoning":"Confirmed by lunar sample analysis."}"#;

struct Harness {
    store: Arc<InMemoryRunStore>,
    jobs: Arc<InMemoryJobQueue>,
    queue: Arc<QueueAdapter>,
    keys: Arc<InMemoryKeySourceStore>,
    credentials: Arc<CredentialResolver>,
    provider: Arc<ScriptedProvider>,
    clock: Arc<ManualClock>,
    leases: RunLeaseManager,
    worker: InvestigationWorker,
}

impl Harness {
    fn new(script: Vec<Result<ai_client::ResponseBody, AiError>>, max_attempts: i32) -> Self {
        let store = Arc::new(InMemoryRunStore::new());
        let jobs = Arc::new(InMemoryJobQueue::new());
        let queue = Arc::new(QueueAdapter::new(jobs.clone().connector(), max_attempts));
        let keys = Arc::new(InMemoryKeySourceStore::linked(store.clone()));
        let credentials = Arc::new(CredentialResolver::new(
            keys.clone(),
            Some(KeyCipher::new(&[7u8; 32])),
            chrono::Duration::milliseconds(KEY_TTL_MS),
        ));
        let provider = Arc::new(ScriptedProvider::new(Arc::new(
            ScriptedResponses::with_results(script),
        )));
        let clock = Arc::new(ManualClock::at(at_ms(0)));
        let leases = RunLeaseManager::new(
            store.clone(),
            clock.clone(),
            chrono::Duration::milliseconds(LEASE_TTL_MS),
        );
        let prompts = Arc::new(PromptCache::with_text(
            Arc::new(InMemoryPromptStore::new()),
            "test-v1",
            "Find factual errors.",
        ));
        let fetcher = Arc::new(
            StaticPageFetcher::new().page("https://a.example/facts", "The moon is rock."),
        );

        let worker = InvestigationWorker::builder()
            .worker_id("w1")
            .leases(leases.clone())
            .queue(queue.clone())
            .prompts(prompts)
            .credentials(credentials.clone())
            .provider(provider.clone())
            .orchestrator(Arc::new(InvestigationOrchestrator::new(
                "gpt-5", 4, fetcher, 4_000,
            )))
            .validator(Arc::new(ClaimValidator::new("gpt-5-mini", 2)))
            .heartbeat_interval(Duration::from_secs(60))
            .poll_interval(Duration::from_millis(10))
            .build();

        Self {
            store,
            jobs,
            queue,
            keys,
            credentials,
            provider,
            clock,
            leases,
            worker,
        }
    }

    fn succeeding() -> Self {
        Self::new(
            vec![
                Ok(completed_text(&sample_claim_json())),
                Ok(completed_text(APPROVE)),
            ],
            4,
        )
    }

    /// A PENDING investigation whose run can still take a per-run key.
    fn new_run(&self) -> (Uuid, Uuid) {
        let (investigation, run) = self.store.add_investigation("The moon is made of cheese.", None);
        (investigation.id, run.id)
    }

    async fn deliver(&self, run_id: Uuid) -> JobOutcome {
        self.queue.enqueue(run_id).await.unwrap();
        let job = self.jobs.take_job("w1").await.unwrap().expect("job is due");
        self.worker.process_job(job).await
    }

    async fn status(&self, run_id: Uuid) -> InvestigationStatus {
        self.store
            .find_run_state(run_id)
            .await
            .unwrap()
            .expect("run exists")
            .status
    }
}

#[tokio::test]
async fn successful_run_persists_approved_claims() {
    let h = Harness::succeeding();
    let (investigation_id, run_id) = h.new_run();

    let outcome = h.deliver(run_id).await;
    assert_eq!(
        outcome,
        JobOutcome::Completed {
            run_id,
            candidates: 1,
            approved: 1
        }
    );

    assert_eq!(h.status(run_id).await, InvestigationStatus::Complete);
    let investigation = h.store.investigation_for_run(run_id).unwrap();
    assert!(investigation.prompt_id.is_some());

    let claims = h.store.claims(investigation_id);
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].claim_index, 0);
    assert_eq!(claims[0].text, "The moon is made of cheese");

    let run = h.store.find_run_state(run_id).await.unwrap().unwrap().run;
    assert!(run.lease_owner.is_none());
    assert!(h.jobs.job_keys().is_empty());
    assert!(h.provider.keys().is_empty());
}

#[tokio::test]
async fn rejected_claims_are_not_persisted() {
    let h = Harness::new(
        vec![
            Ok(completed_text(&sample_claim_json())),
            Ok(completed_text(
                r#"{"approved":false,"reasoning":"The post is satire."}"#,
            )),
        ],
        4,
    );
    let (investigation_id, run_id) = h.new_run();

    let outcome = h.deliver(run_id).await;
    assert!(matches!(
        outcome,
        JobOutcome::Completed {
            candidates: 1,
            approved: 0,
            ..
        }
    ));
    assert_eq!(h.status(run_id).await, InvestigationStatus::Complete);
    assert!(h.store.claims(investigation_id).is_empty());
}

#[tokio::test]
async fn auth_failure_fails_run_without_retry() {
    let h = Harness::new(
        vec![Err(AiError::Api {
            status: 401,
            body: "invalid api key".into(),
        })],
        4,
    );
    let (_, run_id) = h.new_run();

    let outcome = h.deliver(run_id).await;
    let classification = match outcome {
        JobOutcome::Failed { classification, .. } => classification,
        other => panic!("expected Failed, got {other:?}"),
    };
    assert_eq!(classification.kind, ErrorKind::HttpStatus(401));
    assert_eq!(classification.stage, Some("investigate"));

    assert_eq!(h.status(run_id).await, InvestigationStatus::Failed);
    let investigation = h.store.investigation_for_run(run_id).unwrap();
    assert!(investigation
        .failure_reason
        .unwrap()
        .contains("invalid api key"));
    assert!(h.jobs.job_keys().is_empty());
}

#[tokio::test]
async fn server_error_is_retried_and_later_delivery_completes() {
    let h = Harness::new(
        vec![
            Err(AiError::Api {
                status: 500,
                body: "upstream unavailable".into(),
            }),
            Ok(completed_text(&sample_claim_json())),
            Ok(completed_text(APPROVE)),
        ],
        4,
    );
    let (_, run_id) = h.new_run();

    let outcome = h.deliver(run_id).await;
    assert!(matches!(outcome, JobOutcome::Retrying { .. }), "{outcome:?}");

    let state = h.store.find_run_state(run_id).await.unwrap().unwrap();
    assert_eq!(state.status, InvestigationStatus::Processing);
    assert!(state.run.is_held_by("w1"));
    assert_eq!(state.run.recover_after_at, Some(at_ms(0)));

    let key = job_key(run_id);
    let stored = h.jobs.job(&key).expect("job kept for retry");
    assert!(stored.locked_by.is_none());
    assert_eq!(stored.job.attempts, 1);

    // The retry lands after the first lease has lapsed.
    h.clock.advance_ms(LEASE_TTL_MS + 1_000);
    h.jobs.make_due(&key);
    let job = h.jobs.take_job("w1").await.unwrap().expect("retry is due");
    assert_eq!(job.attempts, 2);

    let outcome = h.worker.process_job(job).await;
    assert!(matches!(outcome, JobOutcome::Completed { approved: 1, .. }), "{outcome:?}");
    assert_eq!(h.status(run_id).await, InvestigationStatus::Complete);
    assert!(h.jobs.job_keys().is_empty());
}

#[tokio::test]
async fn retryable_failure_on_last_attempt_fails_run() {
    let h = Harness::new(
        vec![Err(AiError::Timeout("request exceeded 120s".into()))],
        1,
    );
    let (_, run_id) = h.new_run();

    let outcome = h.deliver(run_id).await;
    let classification = match outcome {
        JobOutcome::Failed { classification, .. } => classification,
        other => panic!("expected Failed, got {other:?}"),
    };
    assert_eq!(classification.kind, ErrorKind::Timeout);
    assert!(!classification.is_terminal());
    assert_eq!(h.status(run_id).await, InvestigationStatus::Failed);
    assert!(h.jobs.job_keys().is_empty());
}

#[tokio::test]
async fn delivery_for_run_leased_elsewhere_is_skipped() {
    let h = Harness::succeeding();
    let (_, run_id) = h.new_run();
    assert_eq!(
        h.leases.claim(run_id, "w2").await.unwrap(),
        ClaimOutcome::Claimed
    );

    let outcome = h.deliver(run_id).await;
    assert_eq!(
        outcome,
        JobOutcome::Skipped {
            run_id,
            claim: ClaimOutcome::LeaseHeld
        }
    );
    let state = h.store.find_run_state(run_id).await.unwrap().unwrap();
    assert!(state.run.is_held_by("w2"));
    assert!(h.jobs.job_keys().is_empty());
}

#[tokio::test]
async fn delivery_for_finished_run_is_skipped() {
    let h = Harness::succeeding();
    let (_, run_id) = h.new_run();
    h.deliver(run_id).await;

    let outcome = h.deliver(run_id).await;
    assert_eq!(
        outcome,
        JobOutcome::Skipped {
            run_id,
            claim: ClaimOutcome::Terminal
        }
    );
}

#[tokio::test]
async fn payload_without_run_id_is_discarded() {
    let h = Harness::succeeding();
    let queue = h.queue.queue().await.unwrap();
    queue
        .add_job(NewJob {
            job_key: "investigate-run:bogus".into(),
            task: "investigate".into(),
            payload: serde_json::json!({ "runId": "not-a-uuid" }),
            max_attempts: 4,
        })
        .await
        .unwrap();
    let job = h.jobs.take_job("w1").await.unwrap().unwrap();

    let outcome = h.worker.process_job(job).await;
    assert_eq!(
        outcome,
        JobOutcome::Discarded {
            job_key: "investigate-run:bogus".into()
        }
    );
    assert!(h.jobs.job_keys().is_empty());
}

#[tokio::test]
async fn per_run_key_is_used_once() {
    let h = Harness::succeeding();
    let (_, run_id) = h.new_run();
    assert!(h
        .credentials
        .attach(run_id, "sk-run-key", at_ms(0))
        .await
        .unwrap());
    assert_eq!(h.keys.len(), 1);

    let outcome = h.deliver(run_id).await;
    assert!(matches!(outcome, JobOutcome::Completed { .. }), "{outcome:?}");
    assert_eq!(h.provider.keys(), vec!["sk-run-key".to_string()]);
    assert!(h.keys.is_empty());
}

#[tokio::test]
async fn keyed_run_is_not_retried_on_default_key() {
    let h = Harness::new(
        vec![
            Err(AiError::Api {
                status: 500,
                body: "upstream unavailable".into(),
            }),
            Ok(completed_text(&sample_claim_json())),
            Ok(completed_text(APPROVE)),
        ],
        4,
    );
    let (_, run_id) = h.new_run();
    assert!(h
        .credentials
        .attach(run_id, "sk-run-key", at_ms(0))
        .await
        .unwrap());

    let outcome = h.deliver(run_id).await;
    assert!(matches!(outcome, JobOutcome::Retrying { .. }), "{outcome:?}");
    assert!(h.keys.is_empty());

    h.clock.advance_ms(LEASE_TTL_MS + 1_000);
    let key = job_key(run_id);
    h.jobs.make_due(&key);
    let job = h.jobs.take_job("w1").await.unwrap().expect("retry is due");

    let outcome = h.worker.process_job(job).await;
    let classification = match outcome {
        JobOutcome::Failed { classification, .. } => classification,
        other => panic!("expected Failed, got {other:?}"),
    };
    assert_eq!(classification.kind, ErrorKind::CredentialInvalid);
    assert_eq!(classification.stage, Some("credentials"));
    assert_eq!(h.status(run_id).await, InvestigationStatus::Failed);
    assert_eq!(h.provider.keys(), vec!["sk-run-key".to_string()]);
}

#[tokio::test]
async fn expired_run_key_fails_run() {
    let h = Harness::succeeding();
    let (_, run_id) = h.new_run();
    h.credentials
        .attach(run_id, "sk-run-key", at_ms(0))
        .await
        .unwrap();
    h.clock.advance_ms(KEY_TTL_MS + 1);

    let outcome = h.deliver(run_id).await;
    let classification = match outcome {
        JobOutcome::Failed { classification, .. } => classification,
        other => panic!("expected Failed, got {other:?}"),
    };
    assert_eq!(classification.kind, ErrorKind::CredentialExpired);
    assert_eq!(classification.stage, Some("credentials"));
    assert_eq!(h.status(run_id).await, InvestigationStatus::Failed);
    assert!(h.provider.keys().is_empty());
    assert!(h.keys.is_empty());
}

#[tokio::test]
async fn worker_loop_drains_queue_and_closes_it_on_shutdown() {
    let h = Harness::succeeding();
    let (_, run_id) = h.new_run();
    h.queue.enqueue(run_id).await.unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let worker = &h.worker;
    let run = worker.run(async {
        let _ = stop_rx.await;
    });
    let stop = async {
        for _ in 0..200 {
            if h.store.investigation_for_run(run_id).unwrap().status
                == InvestigationStatus::Complete
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let _ = stop_tx.send(());
    };
    let (result, ()) = tokio::join!(run, stop);

    result.unwrap();
    assert_eq!(h.status(run_id).await, InvestigationStatus::Complete);
    assert_eq!(h.jobs.shutdowns(), 1);
}
