//! Server-Sent Events (SSE) utilities
//!
//! Shared SSE stream construction over the [`crate::events::EventBus`].

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::events::SonicEvent;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Create an SSE stream forwarding bus events with a periodic heartbeat
///
/// Subscribers that lag the broadcast buffer miss the dropped events and
/// keep receiving; the stream never errors. An initial `ConnectionStatus`
/// event confirms the subscription to the client.
pub fn create_event_sse_stream(
    mut rx: broadcast::Receiver<SonicEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE client connected to event stream");

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("ConnectionStatus").data("connected"));

        loop {
            match tokio::time::timeout(HEARTBEAT_INTERVAL, rx.recv()).await {
                Ok(Ok(event)) => {
                    match Event::default().event(event.event_name()).json_data(&event) {
                        Ok(sse_event) => yield Ok(sse_event),
                        Err(e) => debug!("Failed to serialize SSE event: {}", e),
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                    debug!("SSE subscriber lagged, {} events dropped", missed);
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => break,
                Err(_) => {
                    debug!("SSE: Sending heartbeat");
                    yield Ok(Event::default().comment("heartbeat"));
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("heartbeat"),
    )
}
