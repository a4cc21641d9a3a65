//! SSE plumbing: the pipeline's event channel becomes an axum SSE response.
//! The response stream owns a drop guard on the run's cancellation token, so
//! a client disconnect aborts the run; heartbeats ride on axum's keep-alive.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use briefwire_pipeline::OutboundEvent;

fn to_sse_event(outbound: OutboundEvent) -> Option<Event> {
    let result = match outbound {
        OutboundEvent::Stage(stage_event) => {
            Event::default().event("stage-event").json_data(&stage_event)
        }
        OutboundEvent::Named { event, data } => Event::default().event(event).json_data(&data),
    };
    match result {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(error = %err, "Failed to serialize SSE event");
            None
        }
    }
}

/// Wrap a run's event channel into an SSE response. When the client goes
/// away the stream is dropped, the guard cancels the run token, and every
/// in-flight stage aborts.
pub fn sse_response(
    mut rx: UnboundedReceiver<OutboundEvent>,
    cancel: CancellationToken,
    heartbeat_interval_ms: u64,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // Created eagerly: the guard must fire even if the stream is dropped
    // before its first poll.
    let guard = cancel.drop_guard();
    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(outbound) = rx.recv().await {
            if let Some(event) = to_sse_event(outbound) {
                yield Ok(event);
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_millis(heartbeat_interval_ms.max(1)))
            .text("heartbeat"),
    )
}
