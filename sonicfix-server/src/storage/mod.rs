//! Filesystem artifact store
//!
//! Bytes live under the storage root (`uploads/` for source artifacts,
//! `outputs/` for results, `tmp/` for in-flight writes); metadata lives in
//! the `artifacts` table. Writes go to `tmp/` first and are published by
//! rename, so readers never observe a partial artifact. Deletion
//! soft-deletes the metadata row before removing the file; reads that
//! already loaded the bytes are unaffected.

use chrono::Utc;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use sonicfix_common::api::{DirectoryUsage, StorageInfoResponse};
use sonicfix_common::{Error, Result};

use crate::db;
use crate::models::{Artifact, ArtifactKind, NewArtifact};

/// Content types accepted for upload
pub const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "audio/wav",
    "audio/x-wav",
    "audio/wave",
    "audio/mpeg",
    "audio/mp3",
    "audio/flac",
    "audio/x-flac",
    "audio/mp4",
    "audio/x-m4a",
    "audio/m4a",
    "audio/ogg",
];

/// Map a content type (or original filename) to a storage file extension
fn extension_for(content_type: &str, filename: Option<&str>) -> &'static str {
    match content_type {
        "audio/wav" | "audio/x-wav" | "audio/wave" => return ".wav",
        "audio/mpeg" | "audio/mp3" => return ".mp3",
        "audio/flac" | "audio/x-flac" => return ".flac",
        "audio/mp4" | "audio/x-m4a" | "audio/m4a" => return ".m4a",
        "audio/ogg" => return ".ogg",
        _ => {}
    }

    if let Some(name) = filename {
        let lower = name.to_lowercase();
        if lower.ends_with(".wav") {
            return ".wav";
        }
        if lower.ends_with(".mp3") {
            return ".mp3";
        }
        if lower.ends_with(".flac") {
            return ".flac";
        }
        if lower.ends_with(".m4a") {
            return ".m4a";
        }
        if lower.ends_with(".ogg") {
            return ".ogg";
        }
    }

    ".bin"
}

/// Artifact store handle
///
/// Cloning shares the pool; the root path is cheap to clone.
#[derive(Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    db: SqlitePool,
}

impl ArtifactStore {
    pub fn new(root: PathBuf, db: SqlitePool) -> Self {
        Self { root, db }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn subdir_for(kind: ArtifactKind) -> &'static str {
        match kind {
            ArtifactKind::Source => "uploads",
            ArtifactKind::Result => "outputs",
        }
    }

    /// Store bytes and publish a new artifact
    ///
    /// The write is atomic from a reader's point of view: bytes land in
    /// `tmp/`, are renamed into place, and only then does the metadata row
    /// become visible. On failure nothing is published.
    pub async fn put(&self, bytes: &[u8], meta: NewArtifact) -> Result<Artifact> {
        let artifact_id = Uuid::new_v4();
        let ext = extension_for(&meta.content_type, meta.filename.as_deref());
        let storage_path = format!("{}/{}{}", Self::subdir_for(meta.kind), artifact_id, ext);

        let tmp_path = self.root.join("tmp").join(artifact_id.to_string());
        let final_path = self.root.join(&storage_path);

        tokio::fs::write(&tmp_path, bytes)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write artifact bytes: {}", e)))?;

        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(Error::Storage(format!(
                "Failed to publish artifact: {}",
                e
            )));
        }

        let artifact = Artifact {
            artifact_id,
            kind: meta.kind,
            owner_id: meta.owner_id,
            filename: meta.filename,
            content_type: meta.content_type,
            content_length: bytes.len() as u64,
            storage_path,
            created_at: Utc::now(),
            deleted_at: None,
        };

        if let Err(e) = db::artifacts::insert(&self.db, &artifact).await {
            // Roll the published file back so no unreferenced bytes linger
            let _ = tokio::fs::remove_file(&final_path).await;
            return Err(e);
        }

        tracing::debug!(
            artifact_id = %artifact.artifact_id,
            kind = %artifact.kind.as_str(),
            content_length = artifact.content_length,
            "Artifact stored"
        );

        Ok(artifact)
    }

    /// Read the full byte stream of a live artifact
    pub async fn get(&self, artifact_id: Uuid) -> Result<(Artifact, Vec<u8>)> {
        let artifact = self.stat(artifact_id).await?;

        let path = self.root.join(&artifact.storage_path);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            Error::Storage(format!(
                "Artifact {} bytes unreadable at {}: {}",
                artifact_id,
                path.display(),
                e
            ))
        })?;

        Ok((artifact, bytes))
    }

    /// Metadata for a live artifact
    pub async fn stat(&self, artifact_id: Uuid) -> Result<Artifact> {
        db::artifacts::get_live(&self.db, artifact_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Artifact not found: {}", artifact_id)))
    }

    /// Delete an artifact on behalf of `requester`
    ///
    /// Owned artifacts are deletable only by their owner; a mismatched or
    /// missing identity observes NotFound rather than a distinguishable
    /// denial. Unowned artifacts are deletable by anyone.
    pub async fn delete(&self, artifact_id: Uuid, requester: Option<&str>) -> Result<()> {
        let artifact = db::artifacts::get_live(&self.db, artifact_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Artifact not found: {}", artifact_id)))?;

        if let Some(owner) = &artifact.owner_id {
            if requester != Some(owner.as_str()) {
                return Err(Error::NotFound(format!(
                    "Artifact not found: {}",
                    artifact_id
                )));
            }
        }

        self.remove(artifact).await
    }

    /// Delete an artifact without an owner check
    ///
    /// Used internally, e.g. to discard a result artifact whose job lost a
    /// completion race to cancellation.
    pub async fn delete_unchecked(&self, artifact_id: Uuid) -> Result<()> {
        let artifact = db::artifacts::get_live(&self.db, artifact_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Artifact not found: {}", artifact_id)))?;

        self.remove(artifact).await
    }

    async fn remove(&self, artifact: Artifact) -> Result<()> {
        let deleted = db::artifacts::mark_deleted(&self.db, artifact.artifact_id).await?;
        if !deleted {
            return Err(Error::NotFound(format!(
                "Artifact not found: {}",
                artifact.artifact_id
            )));
        }

        // Best effort: the metadata row is authoritative, a straggling file
        // is invisible to readers and harmless.
        let path = self.root.join(&artifact.storage_path);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            tracing::warn!(
                artifact_id = %artifact.artifact_id,
                path = %path.display(),
                error = %e,
                "Failed to remove artifact bytes after soft delete"
            );
        }

        tracing::info!(artifact_id = %artifact.artifact_id, "Artifact deleted");
        Ok(())
    }

    /// Per-directory storage usage summary
    pub async fn storage_info(&self) -> Result<StorageInfoResponse> {
        Ok(StorageInfoResponse {
            root: self.root.display().to_string(),
            uploads: self.directory_usage("uploads").await?,
            outputs: self.directory_usage("outputs").await?,
            tmp: self.directory_usage("tmp").await?,
        })
    }

    async fn directory_usage(&self, sub: &str) -> Result<DirectoryUsage> {
        let dir = self.root.join(sub);
        let mut size_bytes = 0u64;
        let mut file_count = 0u64;

        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read {}: {}", dir.display(), e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Storage(format!("Failed to read {}: {}", dir.display(), e)))?
        {
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| Error::Storage(format!("Failed to stat entry: {}", e)))?;
            if metadata.is_file() {
                size_bytes += metadata.len();
                file_count += 1;
            }
        }

        Ok(DirectoryUsage {
            path: dir.display().to_string(),
            size_bytes,
            file_count,
        })
    }
}
