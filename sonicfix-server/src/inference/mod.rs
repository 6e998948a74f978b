//! Inference engine boundary
//!
//! Narrow interface around the AI models (audio enhancement,
//! text-to-music). The dispatcher treats an engine as a black box: one
//! blocking call per job, optional progress reports, a typed error that
//! classifies whether a retry is worthwhile. Timeouts are applied by the
//! dispatcher, not here.

mod local;

pub use local::LocalEngine;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use sonicfix_common::api::JobKind;

use crate::models::JobParameters;

/// Channel the engine reports progress fractions into
///
/// Values are fractions in [0, 1]; the registry clamps them monotonic, so
/// late or out-of-order reports are harmless. Engines are free to never
/// report; the dispatcher synthesizes progress in that case.
pub type ProgressSink = mpsc::Sender<f64>;

/// One inference invocation
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub kind: JobKind,
    /// Source bytes for enhancement; optional style reference for
    /// generation
    pub input: Option<Vec<u8>>,
    pub parameters: JobParameters,
}

/// Bytes produced by a successful invocation
#[derive(Debug)]
pub struct EngineOutput {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Engine failure classification
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or unsupported input; the caller's fault, never retried
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Inference-time failure; retried with backoff iff `transient`
    #[error("model error: {message}")]
    Model { message: String, transient: bool },
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Model { transient: true, .. })
    }
}

/// Boundary interface to the AI models
///
/// Implementations must be callable concurrently up to the dispatcher's
/// configured worker limit; the dispatcher never exceeds it.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Run one transformation; blocks the worker for the duration
    async fn invoke(
        &self,
        request: &InferenceRequest,
        progress: ProgressSink,
    ) -> Result<EngineOutput, EngineError>;

    /// Engine name for logging
    fn name(&self) -> &'static str;
}
