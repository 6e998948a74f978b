//! Job registry state machine tests
//!
//! Exercises the guarded transitions directly against an in-memory
//! database: claim races, monotonic progress, idempotent terminal
//! transitions, and orphan detection.

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use sonicfix_common::api::{EnhancementType, JobStatus};
use sonicfix_common::Error;
use sonicfix_server::db;
use sonicfix_server::models::{Artifact, ArtifactKind, JobParameters};

async fn test_pool() -> (SqlitePool, tempfile::TempDir) {
    // File-backed: a pooled :memory: database is per-connection
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let pool = db::init_database_pool(&dir.path().join("test.db"))
        .await
        .expect("Failed to open test database");
    (pool, dir)
}

/// Insert an artifact row directly so jobs have a resolvable input
async fn seed_artifact(pool: &SqlitePool) -> Uuid {
    let artifact = Artifact {
        artifact_id: Uuid::new_v4(),
        kind: ArtifactKind::Source,
        owner_id: None,
        filename: Some("in.wav".to_string()),
        content_type: "audio/wav".to_string(),
        content_length: 4,
        storage_path: "uploads/in.wav".to_string(),
        created_at: Utc::now(),
        deleted_at: None,
    };
    db::artifacts::insert(pool, &artifact).await.unwrap();
    artifact.artifact_id
}

fn enhance_params() -> JobParameters {
    JobParameters::Enhance {
        enhancement_type: EnhancementType::RemoveNoise,
    }
}

/// result_artifact_id is set iff completed; error is set iff failed
async fn assert_terminal_invariant(pool: &SqlitePool, job_id: Uuid) {
    let job = db::jobs::get(pool, job_id).await.unwrap().unwrap();
    assert_eq!(
        job.result_artifact_id.is_some(),
        job.status == JobStatus::Completed,
        "result_artifact_id must be set iff completed (status: {})",
        job.status
    );
    assert_eq!(
        job.error.is_some(),
        job.status == JobStatus::Failed,
        "error must be set iff failed (status: {})",
        job.status
    );
}

#[tokio::test]
async fn create_starts_pending_with_clean_fields() {
    let (pool, _dir) = test_pool().await;
    let input = seed_artifact(&pool).await;

    let job = db::jobs::create(&pool, None, Some(input), enhance_params())
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.progress, 0.0);
    assert!(job.result_artifact_id.is_none());
    assert!(job.error.is_none());
    assert!(job.started_at.is_none());
    assert_terminal_invariant(&pool, job.job_id).await;
}

#[tokio::test]
async fn create_rejects_unresolvable_input() {
    let (pool, _dir) = test_pool().await;

    let err = db::jobs::create(&pool, None, Some(Uuid::new_v4()), enhance_params())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn double_claim_has_exactly_one_winner() {
    let (pool, _dir) = test_pool().await;
    let input = seed_artifact(&pool).await;
    let job = db::jobs::create(&pool, None, Some(input), enhance_params())
        .await
        .unwrap();

    db::jobs::transition_to_processing(&pool, job.job_id)
        .await
        .unwrap();

    let err = db::jobs::transition_to_processing(&pool, job.job_id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() {
    let (pool, _dir) = test_pool().await;
    let input = seed_artifact(&pool).await;
    let job = db::jobs::create(&pool, None, Some(input), enhance_params())
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        db::jobs::transition_to_processing(&pool, job.job_id),
        db::jobs::transition_to_processing(&pool, job.job_id),
    );

    let winners = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one concurrent claim must win");
    for result in [a, b] {
        if let Err(e) = result {
            assert!(matches!(e, Error::Conflict(_)));
        }
    }
}

#[tokio::test]
async fn claim_of_unknown_job_is_not_found() {
    let (pool, _dir) = test_pool().await;
    let err = db::jobs::transition_to_processing(&pool, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn progress_is_monotonic_and_clamped() {
    let (pool, _dir) = test_pool().await;
    let input = seed_artifact(&pool).await;
    let job = db::jobs::create(&pool, None, Some(input), enhance_params())
        .await
        .unwrap();
    db::jobs::transition_to_processing(&pool, job.job_id)
        .await
        .unwrap();

    db::jobs::update_progress(&pool, job.job_id, 0.5).await.unwrap();
    // Out-of-order delivery of a lower fraction is a no-op
    db::jobs::update_progress(&pool, job.job_id, 0.3).await.unwrap();
    let current = db::jobs::get(&pool, job.job_id).await.unwrap().unwrap();
    assert_eq!(current.progress, 0.5);

    db::jobs::update_progress(&pool, job.job_id, 0.7).await.unwrap();
    // Values outside [0, 1] are clamped, not stored
    db::jobs::update_progress(&pool, job.job_id, 7.0).await.unwrap();
    let current = db::jobs::get(&pool, job.job_id).await.unwrap().unwrap();
    assert_eq!(current.progress, 1.0);
}

#[tokio::test]
async fn progress_before_claim_is_ignored() {
    let (pool, _dir) = test_pool().await;
    let input = seed_artifact(&pool).await;
    let job = db::jobs::create(&pool, None, Some(input), enhance_params())
        .await
        .unwrap();

    db::jobs::update_progress(&pool, job.job_id, 0.9).await.unwrap();
    let current = db::jobs::get(&pool, job.job_id).await.unwrap().unwrap();
    assert_eq!(current.status, JobStatus::Pending);
    assert_eq!(current.progress, 0.0);
}

#[tokio::test]
async fn complete_is_idempotent_for_same_result_only() {
    let (pool, _dir) = test_pool().await;
    let input = seed_artifact(&pool).await;
    let job = db::jobs::create(&pool, None, Some(input), enhance_params())
        .await
        .unwrap();
    db::jobs::transition_to_processing(&pool, job.job_id)
        .await
        .unwrap();

    let result_a = Uuid::new_v4();
    db::jobs::complete(&pool, job.job_id, result_a).await.unwrap();
    assert_terminal_invariant(&pool, job.job_id).await;

    // Duplicate delivery of the same completion is a no-op
    db::jobs::complete(&pool, job.job_id, result_a).await.unwrap();

    // A different result after completion is a conflict and must not
    // mutate the stored result
    let result_b = Uuid::new_v4();
    let err = db::jobs::complete(&pool, job.job_id, result_b)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    let current = db::jobs::get(&pool, job.job_id).await.unwrap().unwrap();
    assert_eq!(current.status, JobStatus::Completed);
    assert_eq!(current.result_artifact_id, Some(result_a));
    assert_eq!(current.progress, 1.0);
}

#[tokio::test]
async fn complete_requires_processing() {
    let (pool, _dir) = test_pool().await;
    let input = seed_artifact(&pool).await;
    let job = db::jobs::create(&pool, None, Some(input), enhance_params())
        .await
        .unwrap();

    // pending -> completed is not a legal edge
    let err = db::jobs::complete(&pool, job.job_id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

#[tokio::test]
async fn fail_is_allowed_from_pending_and_processing() {
    let (pool, _dir) = test_pool().await;
    let input = seed_artifact(&pool).await;

    // pending -> failed (dispatch-time rejection)
    let job = db::jobs::create(&pool, None, Some(input), enhance_params())
        .await
        .unwrap();
    db::jobs::fail(&pool, job.job_id, "rejected at dispatch").await.unwrap();
    assert_terminal_invariant(&pool, job.job_id).await;

    // processing -> failed
    let job = db::jobs::create(&pool, None, Some(input), enhance_params())
        .await
        .unwrap();
    db::jobs::transition_to_processing(&pool, job.job_id)
        .await
        .unwrap();
    db::jobs::fail(&pool, job.job_id, "inference failed: oom").await.unwrap();
    assert_terminal_invariant(&pool, job.job_id).await;

    // Duplicate delivery of the same failure is a no-op
    db::jobs::fail(&pool, job.job_id, "inference failed: oom").await.unwrap();

    // A different failure after terminal state conflicts
    let err = db::jobs::fail(&pool, job.job_id, "another error")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

#[tokio::test]
async fn terminal_states_are_never_left() {
    let (pool, _dir) = test_pool().await;
    let input = seed_artifact(&pool).await;
    let job = db::jobs::create(&pool, None, Some(input), enhance_params())
        .await
        .unwrap();
    db::jobs::transition_to_processing(&pool, job.job_id)
        .await
        .unwrap();
    let result = Uuid::new_v4();
    db::jobs::complete(&pool, job.job_id, result).await.unwrap();

    // No edge out of completed
    assert!(db::jobs::transition_to_processing(&pool, job.job_id).await.is_err());
    assert!(db::jobs::fail(&pool, job.job_id, "late failure").await.is_err());

    // Late progress callbacks are ignored entirely
    db::jobs::update_progress(&pool, job.job_id, 0.1).await.unwrap();
    let current = db::jobs::get(&pool, job.job_id).await.unwrap().unwrap();
    assert_eq!(current.status, JobStatus::Completed);
    assert_eq!(current.progress, 1.0);
    assert_eq!(current.result_artifact_id, Some(result));
}

#[tokio::test]
async fn orphan_detection_uses_heartbeat_staleness() {
    let (pool, _dir) = test_pool().await;
    let input = seed_artifact(&pool).await;

    let stale = db::jobs::create(&pool, None, Some(input), enhance_params())
        .await
        .unwrap();
    db::jobs::transition_to_processing(&pool, stale.job_id)
        .await
        .unwrap();

    let fresh = db::jobs::create(&pool, None, Some(input), enhance_params())
        .await
        .unwrap();
    db::jobs::transition_to_processing(&pool, fresh.job_id)
        .await
        .unwrap();

    // Back-date the stale job's heartbeat past any threshold
    let old = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
    sqlx::query("UPDATE jobs SET updated_at = ? WHERE job_id = ?")
        .bind(&old)
        .bind(stale.job_id.to_string())
        .execute(&pool)
        .await
        .unwrap();

    let orphaned = db::jobs::list_orphaned(&pool, chrono::Duration::minutes(15))
        .await
        .unwrap();

    let ids: Vec<Uuid> = orphaned.iter().map(|j| j.job_id).collect();
    assert!(ids.contains(&stale.job_id));
    assert!(!ids.contains(&fresh.job_id));
}

#[tokio::test]
async fn cancel_flag_applies_only_to_live_jobs() {
    let (pool, _dir) = test_pool().await;
    let input = seed_artifact(&pool).await;
    let job = db::jobs::create(&pool, None, Some(input), enhance_params())
        .await
        .unwrap();

    assert!(db::jobs::request_cancel(&pool, job.job_id).await.unwrap());
    assert!(db::jobs::cancel_requested(&pool, job.job_id).await.unwrap());

    db::jobs::fail(&pool, job.job_id, "cancelled").await.unwrap();

    // Terminal job refuses further cancel flags
    assert!(!db::jobs::request_cancel(&pool, job.job_id).await.unwrap());
}
