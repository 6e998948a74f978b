//! Artifact metadata model
//!
//! An artifact is an immutable byte blob identified by an opaque id:
//! either an uploaded source file or a generated result. Bytes live on
//! disk under the storage root; this struct is the database row describing
//! them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether an artifact was uploaded or produced by a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Created by client upload
    Source,
    /// Created by a successful job
    Result,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Source => "source",
            ArtifactKind::Result => "result",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "source" => Some(ArtifactKind::Source),
            "result" => Some(ArtifactKind::Result),
            _ => None,
        }
    }
}

/// Stored artifact metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: Uuid,
    pub kind: ArtifactKind,
    /// Opaque requester identity, if the upload carried one
    pub owner_id: Option<String>,
    /// Original client filename (uploads only)
    pub filename: Option<String>,
    pub content_type: String,
    pub content_length: u64,
    /// Path relative to the storage root
    pub storage_path: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Artifact {
    /// An artifact is readable until its owner deletes it
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Metadata supplied when publishing a new artifact
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub kind: ArtifactKind,
    pub owner_id: Option<String>,
    pub filename: Option<String>,
    pub content_type: String,
}
