//! Server-sent event processing shared by the HTTP transports.

use std::fmt::Display;

use eventsource_stream::{Event, Eventsource};
use futures::{Stream, StreamExt};
use lattice_mcp_types::JsonRpcMessage;
use parking_lot::RwLock;
use tracing::trace;

use super::{EventSink, TransportEvent, emit};
use crate::error::{McpError, Result};

/// Read `stream` as server-sent events until it ends.
///
/// `message` events (or events without a name) carry one JSON-RPC message or
/// an array of them; each valid message is forwarded to `sink` and each
/// malformed one is reported there as an error and skipped. The most recent
/// non-empty event id is stored in `checkpoint`. Any other named event is
/// handed to `on_event`.
///
/// Returns `Ok` when the server ends the stream and `Err` when reading fails.
pub(crate) async fn pump_sse<S, B, E>(
    stream: S,
    checkpoint: &RwLock<Option<String>>,
    sink: &EventSink,
    mut on_event: impl FnMut(&Event),
) -> Result<()>
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut events = std::pin::pin!(stream.eventsource());
    while let Some(event) = events.next().await {
        let event = event.map_err(|e| McpError::transport(format!("SSE stream error: {e}")))?;

        if !event.id.is_empty() {
            *checkpoint.write() = Some(event.id.clone());
        }

        match event.event.as_str() {
            "" | "message" => dispatch_data(&event.data, sink),
            _ => {
                trace!(event = %event.event, "SSE event");
                on_event(&event);
            }
        }
    }
    Ok(())
}

/// Parse one `data` payload and forward its messages.
pub(crate) fn dispatch_data(data: &str, sink: &EventSink) {
    if data.trim().is_empty() {
        return;
    }
    match serde_json::from_str(data) {
        Ok(value) => {
            for message in JsonRpcMessage::parse_batch(value) {
                match message {
                    Ok(message) => emit(sink, TransportEvent::Message(message)),
                    Err(e) => emit(sink, TransportEvent::Error(e.into())),
                }
            }
        }
        Err(e) => emit(sink, TransportEvent::Error(e.into())),
    }
}
