//! Server-Sent Events framing of turn events

use crate::runtime::{EventStream, StreamEvent};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::StreamExt;

/// Frame a turn's events as SSE. The response ends with the stream.
pub fn sse_stream(events: EventStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let frames = events.map(|event| Ok(to_sse_event(&event)));

    Sse::new(frames).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn to_sse_event(event: &StreamEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to encode stream event");
        json!({"op": "error", "kind": "internal", "message": "Internal error"}).to_string()
    });
    Event::default().data(data)
}

