//! SSE event stream
//!
//! GET /events streams job and artifact lifecycle events with a periodic
//! heartbeat. Best-effort push on top of the polling API.

use axum::{
    extract::State,
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;

use crate::AppState;

/// GET /events
pub async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    sonicfix_common::sse::create_event_sse_stream(state.event_bus.subscribe())
}
