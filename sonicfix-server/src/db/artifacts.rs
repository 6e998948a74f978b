//! Artifact metadata database operations

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use sonicfix_common::{Error, Result};

use crate::models::{Artifact, ArtifactKind};

fn parse_timestamp(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", field, e)))
}

fn artifact_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Artifact> {
    let artifact_id: String = row.get("artifact_id");
    let artifact_id = Uuid::parse_str(&artifact_id)
        .map_err(|e| Error::Internal(format!("Failed to parse artifact_id: {}", e)))?;

    let kind: String = row.get("kind");
    let kind = ArtifactKind::parse(&kind)
        .ok_or_else(|| Error::Internal(format!("Unknown artifact kind: {}", kind)))?;

    let created_at: String = row.get("created_at");
    let created_at = parse_timestamp(&created_at, "created_at")?;

    let deleted_at: Option<String> = row.get("deleted_at");
    let deleted_at = deleted_at
        .map(|s| parse_timestamp(&s, "deleted_at"))
        .transpose()?;

    Ok(Artifact {
        artifact_id,
        kind,
        owner_id: row.get("owner_id"),
        filename: row.get("filename"),
        content_type: row.get("content_type"),
        content_length: row.get::<i64, _>("content_length") as u64,
        storage_path: row.get("storage_path"),
        created_at,
        deleted_at,
    })
}

/// Insert a new artifact row
pub async fn insert(pool: &SqlitePool, artifact: &Artifact) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO artifacts (
            artifact_id, kind, owner_id, filename, content_type,
            content_length, storage_path, created_at, deleted_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL)
        "#,
    )
    .bind(artifact.artifact_id.to_string())
    .bind(artifact.kind.as_str())
    .bind(&artifact.owner_id)
    .bind(&artifact.filename)
    .bind(&artifact.content_type)
    .bind(artifact.content_length as i64)
    .bind(&artifact.storage_path)
    .bind(artifact.created_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// Load an artifact row regardless of deletion state
pub async fn get_any(pool: &SqlitePool, artifact_id: Uuid) -> Result<Option<Artifact>> {
    let row = sqlx::query("SELECT * FROM artifacts WHERE artifact_id = ?")
        .bind(artifact_id.to_string())
        .fetch_optional(pool)
        .await?;

    row.map(|r| artifact_from_row(&r)).transpose()
}

/// Load a live (non-deleted) artifact row
pub async fn get_live(pool: &SqlitePool, artifact_id: Uuid) -> Result<Option<Artifact>> {
    let row =
        sqlx::query("SELECT * FROM artifacts WHERE artifact_id = ? AND deleted_at IS NULL")
            .bind(artifact_id.to_string())
            .fetch_optional(pool)
            .await?;

    row.map(|r| artifact_from_row(&r)).transpose()
}

/// Soft-delete an artifact row
///
/// Returns false if the row is unknown or already deleted. The guarded
/// UPDATE makes concurrent deletes race safely: exactly one caller
/// observes the transition.
pub async fn mark_deleted(pool: &SqlitePool, artifact_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE artifacts SET deleted_at = ? WHERE artifact_id = ? AND deleted_at IS NULL",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(artifact_id.to_string())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}
