//! Event types for the SonicFix event system
//!
//! Provides the shared event enum and EventBus used to broadcast job and
//! artifact lifecycle changes to SSE subscribers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// SonicFix event types
///
/// Events are broadcast via EventBus and serialized for SSE transmission.
/// Polling the status API remains the authoritative way to observe job
/// state; these events are a best-effort push channel on top of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SonicEvent {
    /// A job row was created in `pending` state
    JobCreated {
        job_id: Uuid,
        kind: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A worker claimed the job and inference started
    JobStarted {
        job_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Progress update (adapter-reported or synthesized)
    JobProgress {
        job_id: Uuid,
        /// Fraction in [0, 1]
        progress: f64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Job reached `completed` with a result artifact
    JobCompleted {
        job_id: Uuid,
        result_file_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Job reached `failed`
    JobFailed {
        job_id: Uuid,
        error: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Client asked for cooperative cancellation
    JobCancelRequested {
        job_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// An artifact was published to the store
    ArtifactStored {
        artifact_id: Uuid,
        kind: String,
        content_length: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// An artifact was deleted by its owner
    ArtifactDeleted {
        artifact_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl SonicEvent {
    /// SSE event name for this event
    pub fn event_name(&self) -> &'static str {
        match self {
            SonicEvent::JobCreated { .. } => "JobCreated",
            SonicEvent::JobStarted { .. } => "JobStarted",
            SonicEvent::JobProgress { .. } => "JobProgress",
            SonicEvent::JobCompleted { .. } => "JobCompleted",
            SonicEvent::JobFailed { .. } => "JobFailed",
            SonicEvent::JobCancelRequested { .. } => "JobCancelRequested",
            SonicEvent::ArtifactStored { .. } => "ArtifactStored",
            SonicEvent::ArtifactDeleted { .. } => "ArtifactDeleted",
        }
    }
}

/// Broadcast event bus
///
/// Thin wrapper over `tokio::sync::broadcast` shared by the dispatcher,
/// API handlers, and SSE streams. Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SonicEvent>,
    capacity: usize,
}

impl EventBus {
    /// Create a new EventBus buffering up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<SonicEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, returning the subscriber count
    ///
    /// Returns `Err` if no subscribers are listening.
    pub fn emit(&self, event: SonicEvent) -> Result<usize, Box<SonicEvent>> {
        self.tx
            .send(event)
            .map_err(|broadcast::error::SendError(ev)| Box::new(ev))
    }

    /// Emit an event, ignoring the no-subscriber case
    ///
    /// Lifecycle events are advisory; a server with no SSE clients connected
    /// simply drops them.
    pub fn emit_lossy(&self, event: SonicEvent) {
        let _ = self.tx.send(event);
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
