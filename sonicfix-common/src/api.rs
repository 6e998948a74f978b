//! Shared API types for SonicFix
//!
//! Request and response bodies exchanged between the server and any client,
//! plus the enums that appear on the wire (job status/kind, enhancement
//! types). Kept here so the server handlers and the client sync layer
//! deserialize the same shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job processing status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// String form stored in the database and sent on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Parse the database/wire string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Terminal states are never left
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of transformation a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Enhance an uploaded audio file
    Enhance,
    /// Generate music from a text prompt
    Generate,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Enhance => "enhance",
            JobKind::Generate => "generate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enhance" => Some(JobKind::Enhance),
            "generate" => Some(JobKind::Generate),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Audio enhancement type selected by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhancementType {
    FixQuality,
    RemoveNoise,
    StudioMaster,
    VocalEnhance,
    BassBoost,
    ClarityBoost,
}

impl EnhancementType {
    /// Engine prompt associated with each enhancement type
    pub fn prompt(&self) -> &'static str {
        match self {
            EnhancementType::FixQuality => {
                "Fix audio quality issues, reduce distortion and improve clarity"
            }
            EnhancementType::RemoveNoise => {
                "Remove background noise and unwanted artifacts while preserving the main audio"
            }
            EnhancementType::StudioMaster => {
                "Apply professional mastering, reduce noise and fix clipping for studio quality"
            }
            EnhancementType::VocalEnhance => {
                "Enhance vocal clarity and presence, reduce sibilance and improve intelligibility"
            }
            EnhancementType::BassBoost => {
                "Enhance low frequencies and bass response while maintaining balance"
            }
            EnhancementType::ClarityBoost => {
                "Improve overall clarity and definition across all frequencies"
            }
        }
    }
}

/// POST /upload response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub file_id: Uuid,
    pub filename: Option<String>,
    pub size: u64,
    pub content_type: String,
    pub upload_time: DateTime<Utc>,
}

/// POST /process request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub file_id: Uuid,
    pub enhancement_type: EnhancementType,
}

/// POST /generate-music request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateMusicRequest {
    /// Lyrics or free-text description of the music to generate
    pub prompt: String,
    /// Target duration in seconds (default 30)
    #[serde(default = "default_generate_duration")]
    pub duration: f64,
    /// Optional style description
    #[serde(default)]
    pub style_prompt: Option<String>,
    /// Optional uploaded artifact used as a style reference
    #[serde(default)]
    pub reference_audio_id: Option<Uuid>,
    /// Optional genre tags folded into the style prompt
    #[serde(default)]
    pub genre_tags: Vec<String>,
}

fn default_generate_duration() -> f64 {
    30.0
}

/// Job status response, returned by POST /process, POST /generate-music
/// and GET /job-status/{job_id}
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_file_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// GET /jobs response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
}

/// POST /cancel/{job_id} response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub cancel_requested: bool,
}

/// DELETE /delete/{artifact_id} response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub file_id: Uuid,
    pub deleted: bool,
}

/// Per-directory usage in the storage info response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryUsage {
    pub path: String,
    pub size_bytes: u64,
    pub file_count: u64,
}

/// GET /storage-info response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfoResponse {
    pub root: String,
    pub uploads: DirectoryUsage,
    pub outputs: DirectoryUsage,
    pub tmp: DirectoryUsage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_roundtrips_through_db_form() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("cancelled"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn enhancement_type_wire_form() {
        let t: EnhancementType = serde_json::from_str("\"remove_noise\"").unwrap();
        assert_eq!(t, EnhancementType::RemoveNoise);
        assert!(t.prompt().contains("noise"));
    }

    #[test]
    fn generate_request_defaults() {
        let req: GenerateMusicRequest =
            serde_json::from_str(r#"{"prompt": "soft piano"}"#).unwrap();
        assert_eq!(req.duration, 30.0);
        assert!(req.reference_audio_id.is_none());
        assert!(req.genre_tags.is_empty());
    }
}
