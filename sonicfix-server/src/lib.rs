//! SonicFix server library interface
//!
//! Exposes the application state and router for integration testing.

pub mod api;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod inference;
pub mod models;
pub mod storage;

pub use crate::error::{ApiError, ApiResult};

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use sonicfix_common::events::EventBus;

use crate::config::ServerConfig;
use crate::dispatch::JobDispatcher;
use crate::storage::ArtifactStore;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool (job registry + artifact metadata)
    pub db: SqlitePool,
    /// Filesystem artifact store
    pub store: ArtifactStore,
    /// Worker pool driving inference jobs
    pub dispatcher: Arc<JobDispatcher>,
    /// Event bus for SSE broadcasting
    pub event_bus: EventBus,
    /// Resolved server configuration
    pub config: Arc<ServerConfig>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        store: ArtifactStore,
        dispatcher: Arc<JobDispatcher>,
        event_bus: EventBus,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            db,
            store,
            dispatcher,
            event_bus,
            config,
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    use axum::routing::get;

    // Leave headroom above the upload ceiling so the 413 check in the
    // handler fires before the transport-level body limit does.
    let body_limit = (state.config.max_upload_bytes as usize)
        .saturating_mul(2)
        .max(1024 * 1024);

    Router::new()
        .merge(api::upload_routes())
        .merge(api::job_routes())
        .merge(api::artifact_routes())
        .merge(api::health_routes())
        .route("/events", get(api::event_stream))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
