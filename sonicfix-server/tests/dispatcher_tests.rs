//! Dispatcher and worker pool tests
//!
//! Mock engines verify the concurrency bound, retry classification,
//! timeout handling, cooperative cancellation, and crash recovery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use sonicfix_common::api::JobStatus;
use sonicfix_common::events::EventBus;
use sonicfix_common::Error;
use sonicfix_server::db;
use sonicfix_server::dispatch::{
    self, DispatcherConfig, JobDispatcher, CANCELLED_ERROR, WORKER_LOST_ERROR,
};
use sonicfix_server::inference::{
    EngineError, EngineOutput, InferenceEngine, InferenceRequest, ProgressSink,
};
use sonicfix_server::models::JobParameters;
use sonicfix_server::storage::ArtifactStore;

/// Engine that records overlap while holding each invocation open
struct TrackingEngine {
    active: AtomicUsize,
    max_active: AtomicUsize,
    invocations: AtomicUsize,
    hold: Duration,
}

impl TrackingEngine {
    fn new(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            invocations: AtomicUsize::new(0),
            hold,
        })
    }
}

#[async_trait]
impl InferenceEngine for TrackingEngine {
    async fn invoke(
        &self,
        _request: &InferenceRequest,
        progress: ProgressSink,
    ) -> Result<EngineOutput, EngineError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        self.invocations.fetch_add(1, Ordering::SeqCst);

        tokio::time::sleep(self.hold).await;
        let _ = progress.try_send(1.0);

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(EngineOutput {
            bytes: b"generated".to_vec(),
            content_type: "audio/wav".to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "tracking"
    }
}

/// Engine that fails a fixed number of times before succeeding
struct FlakyEngine {
    attempts: AtomicUsize,
    failures_before_success: usize,
    transient: bool,
}

impl FlakyEngine {
    fn new(failures_before_success: usize, transient: bool) -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicUsize::new(0),
            failures_before_success,
            transient,
        })
    }
}

#[async_trait]
impl InferenceEngine for FlakyEngine {
    async fn invoke(
        &self,
        _request: &InferenceRequest,
        _progress: ProgressSink,
    ) -> Result<EngineOutput, EngineError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures_before_success {
            return Err(EngineError::Model {
                message: "accelerator out of memory".to_string(),
                transient: self.transient,
            });
        }
        Ok(EngineOutput {
            bytes: b"recovered".to_vec(),
            content_type: "audio/wav".to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

/// Engine that never returns within any test's patience
struct StuckEngine {
    invocations: AtomicUsize,
}

#[async_trait]
impl InferenceEngine for StuckEngine {
    async fn invoke(
        &self,
        _request: &InferenceRequest,
        _progress: ProgressSink,
    ) -> Result<EngineOutput, EngineError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(3600)).await;
        unreachable!("stuck engine should always be abandoned");
    }

    fn name(&self) -> &'static str {
        "stuck"
    }
}

struct TestEnv {
    pool: SqlitePool,
    dispatcher: Arc<JobDispatcher>,
    _dir: tempfile::TempDir,
}

async fn test_env(engine: Arc<dyn InferenceEngine>, config: DispatcherConfig) -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    sonicfix_common::config::ensure_root_folder(dir.path()).unwrap();

    // File-backed: a pooled :memory: database is per-connection
    let pool = db::init_database_pool(&dir.path().join("test.db"))
        .await
        .unwrap();

    let store = ArtifactStore::new(dir.path().to_path_buf(), pool.clone());
    let event_bus = EventBus::new(256);

    let (dispatcher, queue_rx) =
        JobDispatcher::new(pool.clone(), store, engine, event_bus, config);
    dispatcher.spawn(queue_rx);

    TestEnv {
        pool,
        dispatcher,
        _dir: dir,
    }
}

fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        max_concurrent: 2,
        queue_capacity: 64,
        invoke_timeout: Duration::from_secs(10),
        max_transient_retries: 2,
        retry_backoff: Duration::from_millis(10),
        synthetic_progress_interval: Duration::from_millis(30),
        estimated_duration: Duration::from_secs(1),
    }
}

fn generate_params() -> JobParameters {
    JobParameters::Generate {
        prompt: "test tone".to_string(),
        duration: 1.0,
        style_prompt: None,
        genre_tags: Vec::new(),
    }
}

async fn submit_job(env: &TestEnv) -> Uuid {
    let job = db::jobs::create(&env.pool, None, None, generate_params())
        .await
        .unwrap();
    env.dispatcher.submit(job.job_id).unwrap();
    job.job_id
}

async fn wait_terminal(pool: &SqlitePool, job_id: Uuid) -> sonicfix_server::models::Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = db::jobs::get(pool, job_id).await.unwrap().unwrap();
        if job.is_terminal() {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} never reached a terminal state (status: {})",
            job_id,
            job.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn single_slot_serializes_inference() {
    let engine = TrackingEngine::new(Duration::from_millis(80));
    let config = DispatcherConfig {
        max_concurrent: 1,
        ..fast_config()
    };
    let env = test_env(engine.clone(), config).await;

    let mut job_ids = Vec::new();
    for _ in 0..5 {
        job_ids.push(submit_job(&env).await);
    }

    for job_id in &job_ids {
        let job = wait_terminal(&env.pool, *job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.result_artifact_id.is_some());
    }

    assert_eq!(engine.invocations.load(Ordering::SeqCst), 5);
    assert_eq!(
        engine.max_active.load(Ordering::SeqCst),
        1,
        "N=1 must never overlap inference invocations"
    );
}

#[tokio::test]
async fn two_slots_bound_overlap_at_two() {
    let engine = TrackingEngine::new(Duration::from_millis(80));
    let config = DispatcherConfig {
        max_concurrent: 2,
        ..fast_config()
    };
    let env = test_env(engine.clone(), config).await;

    let mut job_ids = Vec::new();
    for _ in 0..5 {
        job_ids.push(submit_job(&env).await);
    }

    for job_id in &job_ids {
        let job = wait_terminal(&env.pool, *job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
    }

    assert!(
        engine.max_active.load(Ordering::SeqCst) <= 2,
        "N=2 must bound overlap at two"
    );
}

#[tokio::test]
async fn transient_failures_are_retried_to_success() {
    let engine = FlakyEngine::new(2, true);
    let env = test_env(engine.clone(), fast_config()).await;

    let job_id = submit_job(&env).await;
    let job = wait_terminal(&env.pool, job_id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        engine.attempts.load(Ordering::SeqCst),
        3,
        "two transient failures then success"
    );
}

#[tokio::test]
async fn transient_retry_budget_is_finite() {
    // More failures than the retry budget allows
    let engine = FlakyEngine::new(10, true);
    let env = test_env(engine.clone(), fast_config()).await;

    let job_id = submit_job(&env).await;
    let job = wait_terminal(&env.pool, job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().unwrap().contains("inference failed"));
    // initial attempt + max_transient_retries
    assert_eq!(engine.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn fatal_model_errors_are_not_retried() {
    let engine = FlakyEngine::new(10, false);
    let env = test_env(engine.clone(), fast_config()).await;

    let job_id = submit_job(&env).await;
    let job = wait_terminal(&env.pool, job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(engine.attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn timeout_fails_job_without_retry() {
    let engine = Arc::new(StuckEngine {
        invocations: AtomicUsize::new(0),
    });
    let config = DispatcherConfig {
        invoke_timeout: Duration::from_millis(100),
        ..fast_config()
    };
    let env = test_env(engine.clone(), config).await;

    let job_id = submit_job(&env).await;
    let job = wait_terminal(&env.pool, job_id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(engine.invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn synthetic_progress_moves_without_engine_reports() {
    // StuckEngine never reports progress; the ticker must
    let engine = Arc::new(StuckEngine {
        invocations: AtomicUsize::new(0),
    });
    let config = DispatcherConfig {
        invoke_timeout: Duration::from_millis(600),
        synthetic_progress_interval: Duration::from_millis(30),
        estimated_duration: Duration::from_secs(1),
        ..fast_config()
    };
    let env = test_env(engine, config).await;

    let job_id = submit_job(&env).await;

    // Sample mid-flight: progress must have moved but never claim completion
    tokio::time::sleep(Duration::from_millis(300)).await;
    let job = db::jobs::get(&env.pool, job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert!(job.progress > 0.0, "synthetic progress never ticked");
    assert!(job.progress <= 0.9, "synthetic progress exceeded its clamp");

    let job = wait_terminal(&env.pool, job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn cancellation_is_honored_mid_inference() {
    let engine = Arc::new(StuckEngine {
        invocations: AtomicUsize::new(0),
    });
    let env = test_env(engine, fast_config()).await;

    let job_id = submit_job(&env).await;

    // Wait for the worker to claim the job
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let job = db::jobs::get(&env.pool, job_id).await.unwrap().unwrap();
        if job.status == JobStatus::Processing {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "job never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Flag first (authoritative), then prompt the live token; the worker
    // honors whichever boundary it reaches first.
    db::jobs::request_cancel(&env.pool, job_id).await.unwrap();
    env.dispatcher.signal_cancel(job_id).await;

    let job = wait_terminal(&env.pool, job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some(CANCELLED_ERROR));
}

#[tokio::test]
async fn full_queue_rejects_submission() {
    let engine = Arc::new(StuckEngine {
        invocations: AtomicUsize::new(0),
    });
    let config = DispatcherConfig {
        max_concurrent: 1,
        queue_capacity: 1,
        invoke_timeout: Duration::from_secs(3600),
        ..fast_config()
    };
    let env = test_env(engine, config).await;

    // First job occupies the single worker slot; the dispatch loop then
    // blocks waiting for a free slot, leaving later jobs queued
    let first = submit_job(&env).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Second fills the single-entry queue; third must be rejected
    let _second = submit_job(&env).await;
    let overflow = db::jobs::create(&env.pool, None, None, generate_params())
        .await
        .unwrap();
    let err = env.dispatcher.submit(overflow.job_id).unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    // The running job is genuinely processing
    let job = db::jobs::get(&env.pool, first).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
}

#[tokio::test]
async fn restart_recovery_fails_orphaned_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let pool = db::init_database_pool(&dir.path().join("test.db"))
        .await
        .unwrap();
    let event_bus = EventBus::new(16);

    // A job left processing by a dead worker, heartbeat long stale
    let job = db::jobs::create(&pool, None, None, generate_params())
        .await
        .unwrap();
    db::jobs::transition_to_processing(&pool, job.job_id)
        .await
        .unwrap();
    let stale = (Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
    sqlx::query("UPDATE jobs SET updated_at = ? WHERE job_id = ?")
        .bind(&stale)
        .bind(job.job_id.to_string())
        .execute(&pool)
        .await
        .unwrap();

    let recovered = dispatch::recover_orphaned_jobs(&pool, &event_bus, Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(recovered, 1);

    let job = db::jobs::get(&pool, job.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some(WORKER_LOST_ERROR));

    // Recovery is idempotent and never resurrects the job
    let recovered = dispatch::recover_orphaned_jobs(&pool, &event_bus, Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(recovered, 0);
    let job = db::jobs::get(&pool, job.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
}

#[tokio::test]
async fn duplicate_submission_invokes_inference_once() {
    let engine = TrackingEngine::new(Duration::from_millis(50));
    let env = test_env(engine.clone(), fast_config()).await;

    let job = db::jobs::create(&env.pool, None, None, generate_params())
        .await
        .unwrap();
    // Duplicate dispatch race: the same id enqueued twice
    env.dispatcher.submit(job.job_id).unwrap();
    env.dispatcher.submit(job.job_id).unwrap();

    let finished = wait_terminal(&env.pool, job.job_id).await;
    assert_eq!(finished.status, JobStatus::Completed);

    // Give the losing dispatch a moment to (not) run
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        engine.invocations.load(Ordering::SeqCst),
        1,
        "conflicted claim must not invoke inference"
    );
}
