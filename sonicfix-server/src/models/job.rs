//! Job model and transformation parameters
//!
//! A job tracks one requested transformation through the state machine
//! `pending -> processing -> {completed, failed}`. Rows are mutated only
//! through the registry's guarded transitions in [`crate::db::jobs`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sonicfix_common::api::{EnhancementType, JobKind, JobResponse, JobStatus};
use uuid::Uuid;

/// Kind-specific transformation parameters, stored as JSON in the job row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobParameters {
    Enhance {
        enhancement_type: EnhancementType,
    },
    Generate {
        prompt: String,
        duration: f64,
        #[serde(default)]
        style_prompt: Option<String>,
        #[serde(default)]
        genre_tags: Vec<String>,
    },
}

impl JobParameters {
    pub fn kind(&self) -> JobKind {
        match self {
            JobParameters::Enhance { .. } => JobKind::Enhance,
            JobParameters::Generate { .. } => JobKind::Generate,
        }
    }
}

/// A transformation job as stored in the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub owner_id: Option<String>,
    /// Source artifact for enhancement; optional style reference for
    /// generation
    pub input_artifact_id: Option<Uuid>,
    pub parameters: JobParameters,
    pub status: JobStatus,
    /// Fraction in [0, 1], monotonically non-decreasing while processing
    pub progress: f64,
    pub result_artifact_id: Option<Uuid>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Touched by every progress write; staleness basis for orphan detection
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wire representation returned by the status API
    pub fn to_response(&self) -> JobResponse {
        JobResponse {
            job_id: self.job_id,
            status: self.status,
            progress: self.progress,
            result_file_id: self.result_artifact_id,
            error: self.error.clone(),
        }
    }
}
