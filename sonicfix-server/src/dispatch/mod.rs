//! Job dispatcher and worker pool
//!
//! Accepts created jobs into a bounded FIFO queue and drives each one
//! through its registry transitions on a worker bounded by a semaphore of
//! `max_concurrent` slots. The dispatcher owns the only long-blocking
//! operation in the system (the engine invocation) and everything wrapped
//! around it: timeout, transient-error retry, progress plumbing,
//! cooperative cancellation, and result publication.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sonicfix_common::events::{EventBus, SonicEvent};
use sonicfix_common::{Error, Result};

use crate::db;
use crate::inference::{EngineError, EngineOutput, InferenceEngine, InferenceRequest};
use crate::models::{ArtifactKind, Job, NewArtifact};
use crate::storage::ArtifactStore;

/// Error recorded on jobs orphaned by a process restart
pub const WORKER_LOST_ERROR: &str = "worker lost: processing was interrupted by a restart";

/// Error recorded on cancelled jobs
pub const CANCELLED_ERROR: &str = "cancelled";

/// Dispatcher tuning knobs
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum concurrent engine invocations (worker slots)
    pub max_concurrent: usize,
    /// Bounded FIFO admission queue depth
    pub queue_capacity: usize,
    /// Hard per-invocation timeout
    pub invoke_timeout: Duration,
    /// Retry budget for transient model errors
    pub max_transient_retries: u32,
    /// Base backoff between transient retries (scaled by attempt)
    pub retry_backoff: Duration,
    /// Cadence of synthesized progress when the engine reports none
    pub synthetic_progress_interval: Duration,
    /// Denominator of the synthesized elapsed/estimated fraction
    pub estimated_duration: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            queue_capacity: 64,
            invoke_timeout: Duration::from_secs(600),
            max_transient_retries: 2,
            retry_backoff: Duration::from_millis(500),
            synthetic_progress_interval: Duration::from_millis(1500),
            estimated_duration: Duration::from_secs(120),
        }
    }
}

/// How a worker's invocation ended short of success
#[derive(Debug)]
enum WorkerFailure {
    InvalidInput(String),
    Model(String),
    Timeout,
    Cancelled,
    Storage(String),
}

impl WorkerFailure {
    fn message(&self, invoke_timeout: Duration) -> String {
        match self {
            WorkerFailure::InvalidInput(msg) => format!("invalid input: {}", msg),
            WorkerFailure::Model(msg) => format!("inference failed: {}", msg),
            WorkerFailure::Timeout => format!(
                "inference timed out after {}s",
                invoke_timeout.as_secs()
            ),
            WorkerFailure::Cancelled => CANCELLED_ERROR.to_string(),
            WorkerFailure::Storage(msg) => format!("failed to store result: {}", msg),
        }
    }
}

/// Job dispatcher handle
pub struct JobDispatcher {
    db: SqlitePool,
    store: ArtifactStore,
    engine: Arc<dyn InferenceEngine>,
    event_bus: EventBus,
    slots: Arc<Semaphore>,
    queue_tx: mpsc::Sender<Uuid>,
    cancel_tokens: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
    config: DispatcherConfig,
}

impl JobDispatcher {
    /// Create a dispatcher and the receiving end of its admission queue
    ///
    /// Call [`JobDispatcher::spawn`] with the returned receiver to start
    /// the dispatch loop.
    pub fn new(
        db: SqlitePool,
        store: ArtifactStore,
        engine: Arc<dyn InferenceEngine>,
        event_bus: EventBus,
        config: DispatcherConfig,
    ) -> (Arc<Self>, mpsc::Receiver<Uuid>) {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.max(1));
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));

        let dispatcher = Arc::new(Self {
            db,
            store,
            engine,
            event_bus,
            slots,
            queue_tx,
            cancel_tokens: Arc::new(RwLock::new(HashMap::new())),
            config,
        });

        (dispatcher, queue_rx)
    }

    /// Start the dispatch loop as a background task
    pub fn spawn(self: &Arc<Self>, queue_rx: mpsc::Receiver<Uuid>) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.run(queue_rx).await;
        });
    }

    /// Enqueue a `pending` job for dispatch
    ///
    /// Fails with `Conflict` when the bounded queue is full; the caller
    /// decides whether to fail the job or surface backpressure.
    pub fn submit(&self, job_id: Uuid) -> Result<()> {
        self.queue_tx.try_send(job_id).map_err(|e| match e {
            TrySendError::Full(_) => Error::Conflict("job queue is full".to_string()),
            TrySendError::Closed(_) => Error::Internal("dispatcher is not running".to_string()),
        })
    }

    /// Cancel the live worker token for a job, if one exists
    ///
    /// Cancellation is cooperative: the worker observes the token at its
    /// next boundary and fails the job. Returns false when the job has no
    /// running worker (still queued, or already finished).
    pub async fn signal_cancel(&self, job_id: Uuid) -> bool {
        if let Some(token) = self.cancel_tokens.read().await.get(&job_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    /// FIFO dispatch loop: one permit, one claim, one worker task
    async fn run(self: Arc<Self>, mut queue_rx: mpsc::Receiver<Uuid>) {
        tracing::info!(
            max_concurrent = self.config.max_concurrent,
            queue_capacity = self.config.queue_capacity,
            engine = self.engine.name(),
            "Dispatcher started"
        );

        loop {
            // Acquire a worker slot first so admitted jobs stay in the
            // bounded queue until a worker can actually take them.
            let permit = match Arc::clone(&self.slots).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let Some(job_id) = queue_rx.recv().await else {
                break;
            };

            match db::jobs::transition_to_processing(&self.db, job_id).await {
                Ok(()) => {}
                Err(Error::Conflict(_)) => {
                    // Already claimed or terminally resolved (duplicate
                    // dispatch, or cancelled while queued): skip without
                    // invoking inference.
                    tracing::debug!(job_id = %job_id, "Skipping non-pending queued job");
                    drop(permit);
                    continue;
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to claim queued job");
                    drop(permit);
                    continue;
                }
            }

            // Only the claim winner registers a token, so a duplicate
            // dispatch of the same id can never displace a live worker's
            // token. Cancels that race this registration are still caught
            // by the worker's database flag checks.
            let token = CancellationToken::new();
            self.cancel_tokens
                .write()
                .await
                .insert(job_id, token.clone());

            self.event_bus.emit_lossy(SonicEvent::JobStarted {
                job_id,
                timestamp: Utc::now(),
            });

            let dispatcher = Arc::clone(&self);
            tokio::spawn(async move {
                dispatcher.run_worker(job_id, token, permit).await;
            });
        }

        tracing::info!("Dispatcher stopped");
    }

    /// Own one claimed job to its terminal state
    async fn run_worker(&self, job_id: Uuid, token: CancellationToken, _permit: OwnedSemaphorePermit) {
        let job = match db::jobs::get(&self.db, job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::error!(job_id = %job_id, "Claimed job disappeared from registry");
                self.cancel_tokens.write().await.remove(&job_id);
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to load claimed job");
                self.cancel_tokens.write().await.remove(&job_id);
                return;
            }
        };

        // A cancel request that arrived while the job was queued is honored
        // before any engine work starts.
        let pre_cancelled = db::jobs::cancel_requested(&self.db, job_id)
            .await
            .unwrap_or(false);

        let outcome = if pre_cancelled {
            Err(WorkerFailure::Cancelled)
        } else {
            self.execute(&job, &token).await
        };

        self.cancel_tokens.write().await.remove(&job_id);

        match outcome {
            Ok(output) => self.publish_result(&job, output).await,
            Err(failure) => {
                let message = failure.message(self.config.invoke_timeout);
                match db::jobs::fail(&self.db, job_id, &message).await {
                    Ok(()) => {
                        tracing::info!(job_id = %job_id, error = %message, "Job failed");
                        self.event_bus.emit_lossy(SonicEvent::JobFailed {
                            job_id,
                            error: message,
                            timestamp: Utc::now(),
                        });
                    }
                    Err(Error::Conflict(_)) => {
                        // Someone else resolved the job first (e.g. a cancel
                        // racing a timeout); the registry kept the winner.
                        tracing::debug!(job_id = %job_id, "Failure superseded by earlier transition");
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to record job failure");
                    }
                }
            }
        }
    }

    /// Load input, wire progress, and drive the engine invocation
    async fn execute(
        &self,
        job: &Job,
        token: &CancellationToken,
    ) -> std::result::Result<EngineOutput, WorkerFailure> {
        let input = match job.input_artifact_id {
            Some(input_id) => match self.store.get(input_id).await {
                Ok((_, bytes)) => Some(bytes),
                Err(Error::NotFound(_)) => {
                    return Err(WorkerFailure::InvalidInput(format!(
                        "input artifact {} is no longer available",
                        input_id
                    )));
                }
                Err(e) => return Err(WorkerFailure::Storage(e.to_string())),
            },
            None => None,
        };

        let request = InferenceRequest {
            kind: job.kind,
            input,
            parameters: job.parameters.clone(),
        };

        let (progress_tx, progress_rx) = mpsc::channel::<f64>(64);
        let engine_reported = Arc::new(AtomicBool::new(false));

        let pump = self.spawn_progress_pump(job.job_id, progress_rx, Arc::clone(&engine_reported));
        let ticker =
            self.spawn_synthetic_ticker(job.job_id, Arc::clone(&engine_reported), token.clone());

        let outcome = self
            .invoke_with_retry(&request, progress_tx.clone(), token)
            .await;

        // An abandoned engine call may still hold a sender, so the pump is
        // aborted rather than drained; the terminal transition owns the
        // final progress value either way.
        drop(progress_tx);
        ticker.abort();
        pump.abort();

        outcome
    }

    /// Forward engine progress reports into the registry
    fn spawn_progress_pump(
        &self,
        job_id: Uuid,
        mut progress_rx: mpsc::Receiver<f64>,
        engine_reported: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let db = self.db.clone();
        let event_bus = self.event_bus.clone();

        tokio::spawn(async move {
            let mut last = 0.0f64;
            while let Some(fraction) = progress_rx.recv().await {
                engine_reported.store(true, Ordering::Relaxed);

                let fraction = fraction.clamp(0.0, 1.0);
                if fraction <= last {
                    // The registry clamps too; skipping here just avoids
                    // pointless writes on out-of-order delivery.
                    continue;
                }
                last = fraction;

                if let Err(e) = db::jobs::update_progress(&db, job_id, fraction).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Progress update failed");
                    continue;
                }
                event_bus.emit_lossy(SonicEvent::JobProgress {
                    job_id,
                    progress: fraction,
                    timestamp: Utc::now(),
                });
            }
        })
    }

    /// Emit time-based progress while the engine stays silent
    ///
    /// `elapsed / estimated_total`, clamped to 0.9 so forward motion never
    /// claims completion before the engine returns. Suppressed permanently
    /// once the engine reports real progress. Each write also refreshes the
    /// worker heartbeat (`updated_at`).
    ///
    /// The tick doubles as the cooperative cancellation boundary: a cancel
    /// flag set in the registry cancels the worker token here even when the
    /// caller missed the in-memory token.
    fn spawn_synthetic_ticker(
        &self,
        job_id: Uuid,
        engine_reported: Arc<AtomicBool>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let db = self.db.clone();
        let event_bus = self.event_bus.clone();
        let interval = self.config.synthetic_progress_interval;
        let estimated = self.config.estimated_duration.as_secs_f64().max(1.0);

        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // completes immediately

            loop {
                tick.tick().await;

                if !token.is_cancelled() {
                    match db::jobs::cancel_requested(&db, job_id).await {
                        Ok(true) => {
                            token.cancel();
                            break;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!(job_id = %job_id, error = %e, "Cancel flag check failed");
                        }
                    }
                }

                if engine_reported.load(Ordering::Relaxed) {
                    continue;
                }

                let fraction = (started.elapsed().as_secs_f64() / estimated).min(0.9);
                if db::jobs::update_progress(&db, job_id, fraction).await.is_ok() {
                    event_bus.emit_lossy(SonicEvent::JobProgress {
                        job_id,
                        progress: fraction,
                        timestamp: Utc::now(),
                    });
                }
            }
        })
    }

    /// Invoke the engine with timeout, cancellation, and transient retry
    async fn invoke_with_retry(
        &self,
        request: &InferenceRequest,
        progress_tx: mpsc::Sender<f64>,
        token: &CancellationToken,
    ) -> std::result::Result<EngineOutput, WorkerFailure> {
        let mut attempt: u32 = 0;

        loop {
            let invocation = self.engine.invoke(request, progress_tx.clone());

            let result = tokio::select! {
                _ = token.cancelled() => {
                    // The engine call is abandoned, not force-killed; the
                    // leak is bounded by the invocation timeout.
                    return Err(WorkerFailure::Cancelled);
                }
                result = tokio::time::timeout(self.config.invoke_timeout, invocation) => result,
            };

            match result {
                Err(_elapsed) => return Err(WorkerFailure::Timeout),
                Ok(Ok(output)) => return Ok(output),
                Ok(Err(err)) if err.is_transient() && attempt < self.config.max_transient_retries => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max = self.config.max_transient_retries,
                        error = %err,
                        "Transient inference error, retrying"
                    );
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Ok(Err(EngineError::InvalidInput(msg))) => {
                    return Err(WorkerFailure::InvalidInput(msg));
                }
                Ok(Err(EngineError::Model { message, .. })) => {
                    return Err(WorkerFailure::Model(message));
                }
            }
        }
    }

    /// Store the engine output and complete the job
    async fn publish_result(&self, job: &Job, output: EngineOutput) {
        let meta = NewArtifact {
            kind: ArtifactKind::Result,
            owner_id: job.owner_id.clone(),
            filename: None,
            content_type: output.content_type.clone(),
        };

        let artifact = match self.store.put(&output.bytes, meta).await {
            Ok(artifact) => artifact,
            Err(e) => {
                let message = format!("failed to store result: {}", e);
                tracing::error!(job_id = %job.job_id, error = %e, "Result storage failed");
                if let Err(fail_err) = db::jobs::fail(&self.db, job.job_id, &message).await {
                    tracing::error!(
                        job_id = %job.job_id,
                        error = %fail_err,
                        "Failed to record storage failure"
                    );
                } else {
                    self.event_bus.emit_lossy(SonicEvent::JobFailed {
                        job_id: job.job_id,
                        error: message,
                        timestamp: Utc::now(),
                    });
                }
                return;
            }
        };

        match db::jobs::complete(&self.db, job.job_id, artifact.artifact_id).await {
            Ok(()) => {
                tracing::info!(
                    job_id = %job.job_id,
                    result_artifact_id = %artifact.artifact_id,
                    "Job completed"
                );
                self.event_bus.emit_lossy(SonicEvent::JobCompleted {
                    job_id: job.job_id,
                    result_file_id: artifact.artifact_id,
                    timestamp: Utc::now(),
                });
            }
            Err(Error::Conflict(_)) => {
                // A cancellation (or another terminal transition) beat the
                // completion; the produced artifact has no owner-visible job,
                // so discard it.
                tracing::info!(
                    job_id = %job.job_id,
                    result_artifact_id = %artifact.artifact_id,
                    "Completion lost to earlier transition, discarding result"
                );
                if let Err(e) = self.store.delete_unchecked(artifact.artifact_id).await {
                    tracing::warn!(
                        artifact_id = %artifact.artifact_id,
                        error = %e,
                        "Failed to discard orphaned result artifact"
                    );
                }
            }
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "Failed to record completion");
            }
        }
    }
}

/// Fail jobs orphaned by a previous process
///
/// Any `processing` row with a heartbeat older than `staleness` belongs to
/// a worker that no longer exists; partial inference state is never
/// checkpointed, so the job is failed rather than resumed and the client
/// is expected to resubmit.
pub async fn recover_orphaned_jobs(
    pool: &SqlitePool,
    event_bus: &EventBus,
    staleness: Duration,
) -> Result<usize> {
    let staleness = chrono::Duration::from_std(staleness)
        .map_err(|e| Error::Internal(format!("Invalid staleness threshold: {}", e)))?;

    let orphaned = db::jobs::list_orphaned(pool, staleness).await?;
    let count = orphaned.len();

    for job in orphaned {
        tracing::warn!(
            job_id = %job.job_id,
            updated_at = %job.updated_at,
            "Failing orphaned job from previous run"
        );
        match db::jobs::fail(pool, job.job_id, WORKER_LOST_ERROR).await {
            Ok(()) => {
                event_bus.emit_lossy(SonicEvent::JobFailed {
                    job_id: job.job_id,
                    error: WORKER_LOST_ERROR.to_string(),
                    timestamp: Utc::now(),
                });
            }
            Err(e) => {
                tracing::error!(job_id = %job.job_id, error = %e, "Failed to fail orphaned job");
            }
        }
    }

    Ok(count)
}
