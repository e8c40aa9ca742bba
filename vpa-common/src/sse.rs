//! Server-Sent Events (SSE) utilities
//!
//! Bridges the broadcast EventBus to an axum SSE response.

use crate::events::AnalysisEvent;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Create an SSE stream from an event-bus receiver
///
/// Emits one SSE event per `AnalysisEvent`, with the event name set to the
/// event type and the payload serialized as JSON. Lagged subscribers skip
/// missed events and keep streaming.
pub fn event_bus_sse_stream(
    mut rx: broadcast::Receiver<AnalysisEvent>,
    service_name: &'static str,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New SSE client connected to {} events", service_name);

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("ConnectionStatus").data("connected"));

        loop {
            match rx.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => {
                        debug!(event_type = event.event_type(), "SSE: forwarding event");
                        yield Ok(Event::default().event(event.event_type()).data(json));
                    }
                    Err(e) => {
                        warn!(error = %e, "SSE: failed to serialize event, skipping");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "SSE: subscriber lagged, events skipped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("SSE: event bus closed, ending stream");
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
