//! HTTP API handlers for the SonicFix server

pub mod artifacts;
pub mod health;
pub mod jobs;
pub mod sse;
pub mod upload;

pub use artifacts::artifact_routes;
pub use health::health_routes;
pub use jobs::job_routes;
pub use sse::event_stream;
pub use upload::upload_routes;

use axum::http::HeaderMap;

/// Opaque requester identity, taken from the `X-User-Id` header
///
/// Authentication itself is out of scope; the header value is treated as
/// an already-verified opaque identity. Absence means an anonymous
/// (free-tier) caller.
pub fn requester(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}
