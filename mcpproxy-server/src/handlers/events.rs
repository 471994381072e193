//! `GET /events`: SSE fan-out of the event bus

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use mcpproxy_events::Subscriber;

use crate::context::AppContext;

pub async fn events(
    State(ctx): State<AppContext>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscriber = ctx.bus.subscribe();
    let heartbeat = ctx.daemon.sse_heartbeat;

    Sse::new(subscriber_stream(subscriber)).keep_alive(
        KeepAlive::new()
            .interval(heartbeat.max(Duration::from_secs(1)))
            .text("heartbeat"),
    )
}

/// Turn bus envelopes into named SSE frames. The stream ends when the
/// bus shuts down; clients reconnect with their own backoff.
fn subscriber_stream(subscriber: Subscriber) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold(subscriber, |mut subscriber| async move {
        let envelope = subscriber.recv().await?;
        let data = serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string());
        let event = Event::default()
            .event(envelope.event.name())
            .id(envelope.seq.to_string())
            .data(data);
        Some((Ok(event), subscriber))
    })
}
