//! Status polling loop
//!
//! Polls GET /job-status/{job_id} for every non-terminal mirrored job on a
//! fixed interval and merges the responses into the mirror. Polling for a
//! job stops once it reaches a terminal state. Transport errors are
//! retried on the next tick; a 404 means the server genuinely does not
//! know the job, which is resolved locally as failed rather than polled
//! forever.

use std::time::Duration;

use uuid::Uuid;

use sonicfix_common::api::JobResponse;

use crate::error::ClientError;
use crate::mirror::JobMirror;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Fixed-interval status poller
#[derive(Debug, Clone)]
pub struct StatusPoller {
    client: reqwest::Client,
    base_url: String,
    interval: Duration,
}

impl StatusPoller {
    /// Create a poller against `base_url` (e.g. `http://127.0.0.1:8000`)
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Fetch the authoritative status of one job
    pub async fn fetch_status(&self, job_id: Uuid) -> Result<JobResponse, ClientError> {
        let url = format!("{}/job-status/{}", self.base_url, job_id);
        let response = self.client.get(&url).send().await?;

        match response.status().as_u16() {
            200 => Ok(response.json::<JobResponse>().await?),
            404 => Err(ClientError::NotFound(job_id)),
            status => Err(ClientError::Server { status }),
        }
    }

    /// One reconciliation pass over every non-terminal mirrored job
    ///
    /// Returns how many snapshots changed. Transport errors leave the
    /// snapshot untouched for the next tick.
    pub async fn poll_once(&self, mirror: &mut JobMirror) -> usize {
        let mut updated = 0;

        for job_id in mirror.poll_candidates() {
            match self.fetch_status(job_id).await {
                Ok(response) => {
                    mirror.apply(&response);
                    updated += 1;
                }
                Err(ClientError::NotFound(_)) => {
                    tracing::warn!(job_id = %job_id, "Server no longer knows job, failing locally");
                    mirror.mark_failed_locally(job_id, "job no longer exists on server");
                    updated += 1;
                }
                Err(e) => {
                    tracing::debug!(job_id = %job_id, error = %e, "Poll failed, will retry");
                }
            }
        }

        updated
    }

    /// Poll on the configured interval until every tracked job is terminal
    ///
    /// Persists the mirror after each pass so a crash never loses more
    /// than one tick of reconciliation.
    pub async fn run_until_idle(&self, mirror: &mut JobMirror) -> Result<(), ClientError> {
        loop {
            if mirror.is_idle() {
                return Ok(());
            }

            self.poll_once(mirror).await;
            mirror.save()?;

            if mirror.is_idle() {
                return Ok(());
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}
