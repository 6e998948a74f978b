//! Persisted local mirror of job state
//!
//! A JSON file holding one snapshot per tracked job. Server state merged
//! in by the poller is authoritative; the only locally-owned field is the
//! `is_processing` flag marking that a live poll loop watches the job.
//! That flag is deliberately cleared on load: a flag persisted by a
//! previous process has no loop behind it and would otherwise show a
//! permanently spinning job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sonicfix_common::api::{JobResponse, JobStatus};

use crate::error::ClientError;

/// Local snapshot of one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: f64,
    pub result_file_id: Option<Uuid>,
    pub error: Option<String>,
    /// True while a live poll loop in this process watches the job
    pub is_processing: bool,
    pub updated_at: DateTime<Utc>,
}

impl JobSnapshot {
    fn tracked(job_id: Uuid) -> Self {
        Self {
            job_id,
            status: JobStatus::Pending,
            progress: 0.0,
            result_file_id: None,
            error: None,
            is_processing: true,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MirrorFile {
    jobs: Vec<JobSnapshot>,
}

/// Persisted job mirror
#[derive(Debug)]
pub struct JobMirror {
    path: PathBuf,
    jobs: HashMap<Uuid, JobSnapshot>,
}

impl JobMirror {
    /// Load the mirror from disk, resetting stale in-flight flags
    ///
    /// A missing file yields an empty mirror; a corrupt file is discarded
    /// with a warning rather than wedging the client.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ClientError> {
        let path = path.into();

        let jobs = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<MirrorFile>(&content) {
                Ok(file) => file.jobs,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Discarding corrupt job mirror"
                    );
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut map = HashMap::with_capacity(jobs.len());
        for mut snapshot in jobs {
            // Stuck-flag reset: no poll loop survived the restart, so no
            // persisted snapshot may claim one.
            if snapshot.is_processing {
                tracing::debug!(job_id = %snapshot.job_id, "Clearing stale in-flight flag");
                snapshot.is_processing = false;
            }
            map.insert(snapshot.job_id, snapshot);
        }

        Ok(Self { path, jobs: map })
    }

    /// Persist the mirror atomically (write to a sibling, then rename)
    pub fn save(&self) -> Result<(), ClientError> {
        let mut jobs: Vec<&JobSnapshot> = self.jobs.values().collect();
        jobs.sort_by_key(|s| s.updated_at);

        let file = MirrorFile {
            jobs: jobs.into_iter().cloned().collect(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &self.path)?;

        Ok(())
    }

    /// Begin tracking a newly created job
    pub fn track(&mut self, job_id: Uuid) {
        self.jobs.insert(job_id, JobSnapshot::tracked(job_id));
    }

    /// Merge an authoritative server response into the mirror
    pub fn apply(&mut self, response: &JobResponse) {
        let snapshot = self
            .jobs
            .entry(response.job_id)
            .or_insert_with(|| JobSnapshot::tracked(response.job_id));

        snapshot.status = response.status;
        snapshot.progress = response.progress;
        snapshot.result_file_id = response.result_file_id;
        snapshot.error = response.error.clone();
        snapshot.is_processing = !response.status.is_terminal();
        snapshot.updated_at = Utc::now();
    }

    /// Resolve a job locally when the server no longer knows it
    pub fn mark_failed_locally(&mut self, job_id: Uuid, error: impl Into<String>) {
        if let Some(snapshot) = self.jobs.get_mut(&job_id) {
            snapshot.status = JobStatus::Failed;
            snapshot.error = Some(error.into());
            snapshot.is_processing = false;
            snapshot.updated_at = Utc::now();
        }
    }

    /// Jobs that still need polling (non-terminal)
    pub fn poll_candidates(&self) -> Vec<Uuid> {
        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = self
            .jobs
            .values()
            .filter(|s| !s.status.is_terminal())
            .map(|s| (s.updated_at, s.job_id))
            .collect();
        candidates.sort();
        candidates.into_iter().map(|(_, id)| id).collect()
    }

    /// True when every tracked job is terminal
    pub fn is_idle(&self) -> bool {
        self.jobs.values().all(|s| s.status.is_terminal())
    }

    pub fn get(&self, job_id: Uuid) -> Option<&JobSnapshot> {
        self.jobs.get(&job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
