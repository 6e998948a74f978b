//! Artifact API handlers
//!
//! GET /download/{artifact_id}, DELETE /delete/{artifact_id},
//! GET /storage-info

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use chrono::Utc;
use uuid::Uuid;

use sonicfix_common::api::{DeleteResponse, StorageInfoResponse};
use sonicfix_common::events::SonicEvent;

use crate::error::ApiResult;
use crate::AppState;

/// GET /download/{artifact_id}
///
/// Raw bytes of a live artifact (uploaded source or generated result).
pub async fn download_artifact(
    State(state): State<AppState>,
    Path(artifact_id): Path<Uuid>,
) -> ApiResult<Response> {
    let (artifact, bytes) = state.store.get(artifact_id).await?;

    let download_name = artifact
        .filename
        .clone()
        .unwrap_or_else(|| {
            artifact
                .storage_path
                .rsplit('/')
                .next()
                .unwrap_or("artifact")
                .to_string()
        });

    let headers = [
        (header::CONTENT_TYPE, artifact.content_type.clone()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", download_name),
        ),
    ];

    Ok((headers, bytes).into_response())
}

/// DELETE /delete/{artifact_id}
///
/// Owner-checked soft delete. Readers that already fetched the bytes are
/// unaffected; subsequent downloads observe 404.
pub async fn delete_artifact(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(artifact_id): Path<Uuid>,
) -> ApiResult<Json<DeleteResponse>> {
    let requester = crate::api::requester(&headers);
    state.store.delete(artifact_id, requester.as_deref()).await?;

    state.event_bus.emit_lossy(SonicEvent::ArtifactDeleted {
        artifact_id,
        timestamp: Utc::now(),
    });

    Ok(Json(DeleteResponse {
        file_id: artifact_id,
        deleted: true,
    }))
}

/// GET /storage-info
///
/// Per-directory usage summary of the storage root.
pub async fn storage_info(State(state): State<AppState>) -> ApiResult<Json<StorageInfoResponse>> {
    Ok(Json(state.store.storage_info().await?))
}

/// Build artifact routes
pub fn artifact_routes() -> Router<AppState> {
    Router::new()
        .route("/download/:artifact_id", get(download_artifact))
        .route("/delete/:artifact_id", delete(delete_artifact))
        .route("/storage-info", get(storage_info))
}
