//! Job registry database operations
//!
//! Single source of truth for job state. Every mutation is a guarded
//! UPDATE whose WHERE clause encodes the legal source states; the row
//! count decides between success and Conflict, which serializes
//! concurrent attempts to claim or finish the same job.
//!
//! State machine: `pending -> processing -> {completed, failed}`, with
//! `pending -> failed` allowed for dispatch-time rejection. Terminal
//! states are never left. Duplicate delivery of the same transition is a
//! no-op; delivery of a contradicting transition is a Conflict.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use sonicfix_common::api::{JobKind, JobStatus};
use sonicfix_common::{Error, Result};

use crate::models::{Job, JobParameters};

fn parse_timestamp(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", field, e)))
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let job_id: String = row.get("job_id");
    let job_id = Uuid::parse_str(&job_id)
        .map_err(|e| Error::Internal(format!("Failed to parse job_id: {}", e)))?;

    let kind: String = row.get("kind");
    let kind = JobKind::parse(&kind)
        .ok_or_else(|| Error::Internal(format!("Unknown job kind: {}", kind)))?;

    let status: String = row.get("status");
    let status = JobStatus::parse(&status)
        .ok_or_else(|| Error::Internal(format!("Unknown job status: {}", status)))?;

    let parameters: String = row.get("parameters");
    let parameters: JobParameters = serde_json::from_str(&parameters)
        .map_err(|e| Error::Internal(format!("Failed to deserialize parameters: {}", e)))?;

    let input_artifact_id: Option<String> = row.get("input_artifact_id");
    let input_artifact_id = input_artifact_id
        .map(|s| {
            Uuid::parse_str(&s)
                .map_err(|e| Error::Internal(format!("Failed to parse input_artifact_id: {}", e)))
        })
        .transpose()?;

    let result_artifact_id: Option<String> = row.get("result_artifact_id");
    let result_artifact_id = result_artifact_id
        .map(|s| {
            Uuid::parse_str(&s)
                .map_err(|e| Error::Internal(format!("Failed to parse result_artifact_id: {}", e)))
        })
        .transpose()?;

    let created_at: String = row.get("created_at");
    let created_at = parse_timestamp(&created_at, "created_at")?;

    let started_at: Option<String> = row.get("started_at");
    let started_at = started_at
        .map(|s| parse_timestamp(&s, "started_at"))
        .transpose()?;

    let completed_at: Option<String> = row.get("completed_at");
    let completed_at = completed_at
        .map(|s| parse_timestamp(&s, "completed_at"))
        .transpose()?;

    let updated_at: String = row.get("updated_at");
    let updated_at = parse_timestamp(&updated_at, "updated_at")?;

    Ok(Job {
        job_id,
        kind,
        owner_id: row.get("owner_id"),
        input_artifact_id,
        parameters,
        status,
        progress: row.get("progress"),
        result_artifact_id,
        error: row.get("error"),
        cancel_requested: row.get::<i64, _>("cancel_requested") != 0,
        created_at,
        started_at,
        completed_at,
        updated_at,
    })
}

/// Insert a new job in `pending` state
///
/// Fails with `InvalidInput` if `input_artifact_id` is given but does not
/// resolve to a live artifact.
pub async fn create(
    pool: &SqlitePool,
    owner_id: Option<String>,
    input_artifact_id: Option<Uuid>,
    parameters: JobParameters,
) -> Result<Job> {
    if let Some(input_id) = input_artifact_id {
        let exists = crate::db::artifacts::get_live(pool, input_id).await?.is_some();
        if !exists {
            return Err(Error::InvalidInput(format!(
                "Input artifact not found: {}",
                input_id
            )));
        }
    }

    let now = Utc::now();
    let job = Job {
        job_id: Uuid::new_v4(),
        kind: parameters.kind(),
        owner_id,
        input_artifact_id,
        parameters,
        status: JobStatus::Pending,
        progress: 0.0,
        result_artifact_id: None,
        error: None,
        cancel_requested: false,
        created_at: now,
        started_at: None,
        completed_at: None,
        updated_at: now,
    };

    let parameters_json = serde_json::to_string(&job.parameters)
        .map_err(|e| Error::Internal(format!("Failed to serialize parameters: {}", e)))?;

    sqlx::query(
        r#"
        INSERT INTO jobs (
            job_id, kind, owner_id, input_artifact_id, parameters,
            status, progress, cancel_requested, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, 'pending', 0.0, 0, ?, ?)
        "#,
    )
    .bind(job.job_id.to_string())
    .bind(job.kind.as_str())
    .bind(&job.owner_id)
    .bind(job.input_artifact_id.map(|id| id.to_string()))
    .bind(&parameters_json)
    .bind(job.created_at.to_rfc3339())
    .bind(job.updated_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(job)
}

/// Load a job by id
pub async fn get(pool: &SqlitePool, job_id: Uuid) -> Result<Option<Job>> {
    let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?")
        .bind(job_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(|r| job_from_row(&r)).transpose()
}

/// List jobs, newest first, optionally filtered by owner and status
pub async fn list(
    pool: &SqlitePool,
    owner_id: Option<&str>,
    status: Option<JobStatus>,
) -> Result<Vec<Job>> {
    let rows = match (owner_id, status) {
        (Some(owner), Some(status)) => {
            sqlx::query(
                "SELECT * FROM jobs WHERE owner_id = ? AND status = ? ORDER BY created_at DESC",
            )
            .bind(owner)
            .bind(status.as_str())
            .fetch_all(pool)
            .await?
        }
        (Some(owner), None) => {
            sqlx::query("SELECT * FROM jobs WHERE owner_id = ? ORDER BY created_at DESC")
                .bind(owner)
                .fetch_all(pool)
                .await?
        }
        (None, Some(status)) => {
            sqlx::query("SELECT * FROM jobs WHERE status = ? ORDER BY created_at DESC")
                .bind(status.as_str())
                .fetch_all(pool)
                .await?
        }
        (None, None) => {
            sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC")
                .fetch_all(pool)
                .await?
        }
    };

    rows.iter().map(job_from_row).collect()
}

/// Claim a `pending` job for a worker
///
/// Exactly one concurrent caller wins; the rest observe `Conflict`. This
/// is the double-dispatch guard.
pub async fn transition_to_processing(pool: &SqlitePool, job_id: Uuid) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'processing', started_at = ?, updated_at = ?
        WHERE job_id = ? AND status = 'pending'
        "#,
    )
    .bind(&now)
    .bind(&now)
    .bind(job_id.to_string())
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        return Ok(());
    }

    match get(pool, job_id).await? {
        None => Err(Error::NotFound(format!("Job not found: {}", job_id))),
        Some(job) => {
            tracing::warn!(
                job_id = %job_id,
                status = %job.status,
                "Refused processing claim on non-pending job"
            );
            Err(Error::Conflict(format!(
                "Job {} is not pending (status: {})",
                job_id, job.status
            )))
        }
    }
}

/// Record a progress fraction for a `processing` job
///
/// Progress is clamped monotonically non-decreasing; a lower fraction is a
/// no-op, not an error. Updates while the job is not processing (late
/// callbacks racing completion) are silently ignored. Every accepted call
/// touches `updated_at`, which doubles as the worker heartbeat for orphan
/// detection.
pub async fn update_progress(pool: &SqlitePool, job_id: Uuid, fraction: f64) -> Result<()> {
    let fraction = fraction.clamp(0.0, 1.0);
    sqlx::query(
        r#"
        UPDATE jobs
        SET progress = MAX(progress, ?), updated_at = ?
        WHERE job_id = ? AND status = 'processing'
        "#,
    )
    .bind(fraction)
    .bind(Utc::now().to_rfc3339())
    .bind(job_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Transition a `processing` job to `completed` with its result artifact
///
/// Idempotent: a duplicate `complete` with the same result is a no-op; a
/// different result after completion is a `Conflict` and does not mutate
/// the stored `result_artifact_id`.
pub async fn complete(pool: &SqlitePool, job_id: Uuid, result_artifact_id: Uuid) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'completed', result_artifact_id = ?, progress = 1.0,
            error = NULL, completed_at = ?, updated_at = ?
        WHERE job_id = ? AND status = 'processing'
        "#,
    )
    .bind(result_artifact_id.to_string())
    .bind(&now)
    .bind(&now)
    .bind(job_id.to_string())
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        return Ok(());
    }

    match get(pool, job_id).await? {
        None => Err(Error::NotFound(format!("Job not found: {}", job_id))),
        Some(job)
            if job.status == JobStatus::Completed
                && job.result_artifact_id == Some(result_artifact_id) =>
        {
            // Duplicate delivery of the same completion
            Ok(())
        }
        Some(job) => {
            tracing::warn!(
                job_id = %job_id,
                status = %job.status,
                "Refused completion of non-processing job"
            );
            Err(Error::Conflict(format!(
                "Job {} cannot complete from status {}",
                job_id, job.status
            )))
        }
    }
}

/// Transition a `pending` or `processing` job to `failed`
///
/// Idempotent against duplicate delivery of the same failure.
pub async fn fail(pool: &SqlitePool, job_id: Uuid, error: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET status = 'failed', error = ?, completed_at = ?, updated_at = ?
        WHERE job_id = ? AND status IN ('pending', 'processing')
        "#,
    )
    .bind(error)
    .bind(&now)
    .bind(&now)
    .bind(job_id.to_string())
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        return Ok(());
    }

    match get(pool, job_id).await? {
        None => Err(Error::NotFound(format!("Job not found: {}", job_id))),
        Some(job) if job.status == JobStatus::Failed && job.error.as_deref() == Some(error) => {
            Ok(())
        }
        Some(job) => {
            tracing::warn!(
                job_id = %job_id,
                status = %job.status,
                "Refused failure of terminal job"
            );
            Err(Error::Conflict(format!(
                "Job {} cannot fail from status {}",
                job_id, job.status
            )))
        }
    }
}

/// Flag a non-terminal job for cooperative cancellation
///
/// Returns false if the job is already terminal (or unknown; callers that
/// care load the job first).
pub async fn request_cancel(pool: &SqlitePool, job_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET cancel_requested = 1, updated_at = ?
        WHERE job_id = ? AND status IN ('pending', 'processing')
        "#,
    )
    .bind(Utc::now().to_rfc3339())
    .bind(job_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Whether cancellation has been requested for a job
pub async fn cancel_requested(pool: &SqlitePool, job_id: Uuid) -> Result<bool> {
    let flag: Option<i64> =
        sqlx::query_scalar("SELECT cancel_requested FROM jobs WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_optional(pool)
            .await?;

    Ok(flag.unwrap_or(0) != 0)
}

/// Jobs stuck in `processing` with no progress update within `staleness`
///
/// Used by crash recovery: a processing row whose worker heartbeat is
/// older than the threshold has no live worker and will never finish.
pub async fn list_orphaned(pool: &SqlitePool, staleness: chrono::Duration) -> Result<Vec<Job>> {
    let rows = sqlx::query("SELECT * FROM jobs WHERE status = 'processing'")
        .fetch_all(pool)
        .await?;

    let cutoff = Utc::now() - staleness;
    let mut orphaned = Vec::new();
    for row in &rows {
        let job = job_from_row(row)?;
        if job.updated_at < cutoff {
            orphaned.push(job);
        }
    }

    Ok(orphaned)
}

/// Ids of all `pending` jobs in FIFO (creation) order
///
/// Used on startup to re-enqueue work that was accepted but not yet
/// dispatched when the previous process stopped.
pub async fn list_pending_ids(pool: &SqlitePool) -> Result<Vec<Uuid>> {
    let ids: Vec<String> =
        sqlx::query_scalar("SELECT job_id FROM jobs WHERE status = 'pending' ORDER BY created_at")
            .fetch_all(pool)
            .await?;

    ids.iter()
        .map(|s| {
            Uuid::parse_str(s).map_err(|e| Error::Internal(format!("Failed to parse job_id: {}", e)))
        })
        .collect()
}
