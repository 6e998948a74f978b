//! Job API handlers
//!
//! POST /process, POST /generate-music, GET /job-status/{job_id},
//! GET /jobs, POST /cancel/{job_id}

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use sonicfix_common::api::{
    CancelResponse, GenerateMusicRequest, JobListResponse, JobResponse, JobStatus, ProcessRequest,
};
use sonicfix_common::events::SonicEvent;
use sonicfix_common::Error;

use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::models::JobParameters;
use crate::AppState;

/// Create a pending job and hand it to the dispatcher
///
/// If the bounded admission queue is full the job is failed at dispatch
/// time (`pending -> failed`), and the caller observes a terminal job
/// rather than a transport error.
async fn create_and_dispatch(
    state: &AppState,
    owner_id: Option<String>,
    input_artifact_id: Option<Uuid>,
    parameters: JobParameters,
) -> ApiResult<JobResponse> {
    let job = db::jobs::create(&state.db, owner_id, input_artifact_id, parameters).await?;

    tracing::info!(job_id = %job.job_id, kind = %job.kind, "Job created");
    state.event_bus.emit_lossy(SonicEvent::JobCreated {
        job_id: job.job_id,
        kind: job.kind.as_str().to_string(),
        timestamp: Utc::now(),
    });

    if let Err(e) = state.dispatcher.submit(job.job_id) {
        let message = format!("rejected at dispatch: {}", e);
        tracing::warn!(job_id = %job.job_id, error = %e, "Dispatch rejected, failing job");
        db::jobs::fail(&state.db, job.job_id, &message).await?;
        state.event_bus.emit_lossy(SonicEvent::JobFailed {
            job_id: job.job_id,
            error: message,
            timestamp: Utc::now(),
        });

        let failed = db::jobs::get(&state.db, job.job_id)
            .await?
            .ok_or_else(|| ApiError::Internal("Job vanished after creation".to_string()))?;
        return Ok(failed.to_response());
    }

    Ok(job.to_response())
}

/// POST /process
///
/// Start an enhancement job over an uploaded artifact.
pub async fn process_audio(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ProcessRequest>,
) -> ApiResult<Json<JobResponse>> {
    // Resolve the input before creating any job row
    state.store.stat(request.file_id).await.map_err(|_| {
        ApiError::NotFound(format!("Input file not found: {}", request.file_id))
    })?;

    let response = create_and_dispatch(
        &state,
        crate::api::requester(&headers),
        Some(request.file_id),
        JobParameters::Enhance {
            enhancement_type: request.enhancement_type,
        },
    )
    .await?;

    Ok(Json(response))
}

/// POST /generate-music
///
/// Start a text-to-music generation job. Duration is bounded, with a
/// lower cap for anonymous (free-tier) callers; violations are rejected
/// before any job is created.
pub async fn generate_music(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<GenerateMusicRequest>,
) -> ApiResult<Json<JobResponse>> {
    let prompt = request.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(ApiError::BadRequest("Prompt must not be empty".to_string()));
    }

    if !request.duration.is_finite() || request.duration <= 0.0 {
        return Err(ApiError::BadRequest(
            "Duration must be a positive number of seconds".to_string(),
        ));
    }

    let owner_id = crate::api::requester(&headers);
    let cap = state.config.generate_duration_cap(owner_id.is_some());
    if request.duration > cap {
        return Err(ApiError::BadRequest(format!(
            "Duration {}s exceeds the {}s limit{}",
            request.duration,
            cap,
            if owner_id.is_none() {
                " for anonymous requests"
            } else {
                ""
            }
        )));
    }

    if let Some(reference_id) = request.reference_audio_id {
        state.store.stat(reference_id).await.map_err(|_| {
            ApiError::NotFound(format!("Reference audio not found: {}", reference_id))
        })?;
    }

    let response = create_and_dispatch(
        &state,
        owner_id,
        request.reference_audio_id,
        JobParameters::Generate {
            prompt,
            duration: request.duration,
            style_prompt: request.style_prompt.clone(),
            genre_tags: request.genre_tags.clone(),
        },
    )
    .await?;

    Ok(Json(response))
}

/// GET /job-status/{job_id}
///
/// Pure read against the registry; safe to poll at high frequency.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobResponse>> {
    let job = db::jobs::get(&state.db, job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job not found: {}", job_id)))?;

    Ok(Json(job.to_response()))
}

/// GET /jobs query parameters
#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    pub status: Option<String>,
}

/// GET /jobs
///
/// List jobs, newest first. Scoped to the requester's identity when one
/// is supplied; otherwise lists everything (auth-less deployment).
pub async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<JobListQuery>,
) -> ApiResult<Json<JobListResponse>> {
    let status = query
        .status
        .as_deref()
        .map(|s| {
            JobStatus::parse(s)
                .ok_or_else(|| ApiError::BadRequest(format!("Unknown status filter: {}", s)))
        })
        .transpose()?;

    let owner = crate::api::requester(&headers);
    let jobs = db::jobs::list(&state.db, owner.as_deref(), status).await?;

    Ok(Json(JobListResponse {
        jobs: jobs.iter().map(|j| j.to_response()).collect(),
    }))
}

/// POST /cancel/{job_id}
///
/// Mark a job for cooperative cancellation. A still-pending job is failed
/// immediately; a processing job is cancelled at its worker's next
/// progress boundary. Terminal jobs conflict.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<CancelResponse>> {
    let job = db::jobs::get(&state.db, job_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Job not found: {}", job_id)))?;

    if job.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "Job {} already finished (status: {})",
            job_id, job.status
        )));
    }

    db::jobs::request_cancel(&state.db, job_id).await?;
    state.event_bus.emit_lossy(SonicEvent::JobCancelRequested {
        job_id,
        timestamp: Utc::now(),
    });

    if job.status == JobStatus::Pending {
        // Never claimed by a worker: resolve it right here
        match db::jobs::fail(&state.db, job_id, crate::dispatch::CANCELLED_ERROR).await {
            Ok(()) => {
                state.event_bus.emit_lossy(SonicEvent::JobFailed {
                    job_id,
                    error: crate::dispatch::CANCELLED_ERROR.to_string(),
                    timestamp: Utc::now(),
                });
            }
            Err(Error::Conflict(_)) => {
                // A worker claimed it between our read and the fail; fall
                // through to the cooperative path.
                state.dispatcher.signal_cancel(job_id).await;
            }
            Err(e) => return Err(e.into()),
        }
    } else {
        state.dispatcher.signal_cancel(job_id).await;
    }

    tracing::info!(job_id = %job_id, "Cancellation requested");

    Ok(Json(CancelResponse {
        job_id,
        cancel_requested: true,
    }))
}

/// Build job routes
pub fn job_routes() -> Router<AppState> {
    Router::new()
        .route("/process", post(process_audio))
        .route("/generate-music", post(generate_music))
        .route("/job-status/:job_id", get(get_job_status))
        .route("/jobs", get(list_jobs))
        .route("/cancel/:job_id", post(cancel_job))
}
