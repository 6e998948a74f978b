//! Upload API handler
//!
//! POST /upload accepts a multipart audio file, validates size and content
//! type synchronously, and publishes a source artifact. Oversized or
//! non-audio uploads are rejected here, never deferred into a job that
//! fails later.

use axum::{
    extract::{Multipart, State},
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use chrono::Utc;

use sonicfix_common::api::UploadResponse;
use sonicfix_common::events::SonicEvent;

use crate::error::{ApiError, ApiResult};
use crate::models::{ArtifactKind, NewArtifact};
use crate::storage::ALLOWED_CONTENT_TYPES;
use crate::AppState;

/// Resolve the effective content type of an upload
///
/// Declared type wins when it is in the allow-list; otherwise the bytes
/// are sniffed, and finally the filename extension is consulted. Returns
/// None when nothing identifies the payload as supported audio.
fn resolve_content_type(
    declared: Option<&str>,
    filename: Option<&str>,
    bytes: &[u8],
) -> Option<String> {
    if let Some(declared) = declared {
        let declared = declared.trim();
        if ALLOWED_CONTENT_TYPES.contains(&declared) {
            return Some(declared.to_string());
        }
    }

    if let Some(kind) = infer::get(bytes) {
        if kind.matcher_type() == infer::MatcherType::Audio
            && ALLOWED_CONTENT_TYPES.contains(&kind.mime_type())
        {
            return Some(kind.mime_type().to_string());
        }
    }

    if let Some(name) = filename {
        let lower = name.to_lowercase();
        if lower.ends_with(".wav") {
            return Some("audio/wav".to_string());
        }
        if lower.ends_with(".mp3") {
            return Some("audio/mpeg".to_string());
        }
        if lower.ends_with(".flac") {
            return Some("audio/flac".to_string());
        }
        if lower.ends_with(".m4a") {
            return Some("audio/mp4".to_string());
        }
        if lower.ends_with(".ogg") {
            return Some("audio/ogg".to_string());
        }
    }

    None
}

/// POST /upload
///
/// Multipart body with a `file` field. Returns the new artifact id.
pub async fn upload_audio(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let max_bytes = state.config.max_upload_bytes;

    // Reject obviously oversized requests before buffering the body
    if let Some(length) = headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        if length > max_bytes {
            return Err(ApiError::PayloadTooLarge(format!(
                "Upload of {} bytes exceeds the {} byte limit",
                length, max_bytes
            )));
        }
    }

    let mut upload: Option<(Option<String>, Option<String>, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        if field.name() != Some("file") && field.file_name().is_none() {
            continue;
        }

        let filename = field.file_name().map(String::from);
        let declared = field.content_type().map(String::from);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read upload: {}", e)))?;

        upload = Some((filename, declared, bytes.to_vec()));
        break;
    }

    let (filename, declared, bytes) =
        upload.ok_or_else(|| ApiError::BadRequest("Missing file field".to_string()))?;

    if bytes.is_empty() {
        return Err(ApiError::BadRequest("Uploaded file is empty".to_string()));
    }

    if bytes.len() as u64 > max_bytes {
        return Err(ApiError::PayloadTooLarge(format!(
            "Upload of {} bytes exceeds the {} byte limit",
            bytes.len(),
            max_bytes
        )));
    }

    let content_type = resolve_content_type(declared.as_deref(), filename.as_deref(), &bytes)
        .ok_or_else(|| {
            ApiError::UnsupportedMedia(
                "File must be audio (wav, mp3, flac, m4a, or ogg)".to_string(),
            )
        })?;

    let artifact = state
        .store
        .put(
            &bytes,
            NewArtifact {
                kind: ArtifactKind::Source,
                owner_id: crate::api::requester(&headers),
                filename: filename.clone(),
                content_type,
            },
        )
        .await?;

    tracing::info!(
        artifact_id = %artifact.artifact_id,
        content_length = artifact.content_length,
        content_type = %artifact.content_type,
        "Upload stored"
    );

    state.event_bus.emit_lossy(SonicEvent::ArtifactStored {
        artifact_id: artifact.artifact_id,
        kind: artifact.kind.as_str().to_string(),
        content_length: artifact.content_length,
        timestamp: Utc::now(),
    });

    Ok(Json(UploadResponse {
        file_id: artifact.artifact_id,
        filename: artifact.filename,
        size: artifact.content_length,
        content_type: artifact.content_type,
        upload_time: artifact.created_at,
    }))
}

/// Build upload routes
pub fn upload_routes() -> Router<AppState> {
    Router::new().route("/upload", post(upload_audio))
}
