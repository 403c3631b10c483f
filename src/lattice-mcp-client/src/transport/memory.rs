//! In-process transport pair.

use async_trait::async_trait;
use lattice_mcp_types::JsonRpcMessage;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{EventSink, Transport, TransportEvent, emit};
use crate::error::{McpError, Result};

/// One end of a linked pair. Messages sent on one end are delivered to the
/// sink of the other; closing either end closes both.
pub struct InMemoryTransport {
    outbox: Mutex<Option<mpsc::UnboundedSender<JsonRpcMessage>>>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<JsonRpcMessage>>>,
    sink: Mutex<Option<EventSink>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryTransport {
    /// Create a linked pair. Messages sent before the peer starts are buffered.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }

    fn new(
        outbox: mpsc::UnboundedSender<JsonRpcMessage>,
        inbox: mpsc::UnboundedReceiver<JsonRpcMessage>,
    ) -> Self {
        Self {
            outbox: Mutex::new(Some(outbox)),
            inbox: Mutex::new(Some(inbox)),
            sink: Mutex::new(None),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn start(&self, sink: EventSink) -> Result<()> {
        let mut inbox = self
            .inbox
            .lock()
            .take()
            .ok_or_else(|| McpError::transport("in-memory transport already started"))?;
        *self.sink.lock() = Some(sink.clone());

        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => return,
                    message = inbox.recv() => message,
                };
                match message {
                    Some(message) => emit(&sink, TransportEvent::Message(message)),
                    None => break,
                }
            }
            emit(&sink, TransportEvent::Closed);
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    async fn send(&self, messages: Vec<JsonRpcMessage>) -> Result<()> {
        let outbox = self.outbox.lock().clone().ok_or(McpError::Closed)?;
        for message in messages {
            outbox.send(message).map_err(|_| McpError::Closed)?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.outbox.lock().take();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        let sink = self.sink.lock().take();
        if let Some(sink) = sink {
            emit(&sink, TransportEvent::Closed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_mcp_types::JsonRpcNotification;

    #[tokio::test]
    async fn test_pair_delivers_and_closes() {
        let (client, server) = InMemoryTransport::pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.start(tx).await.expect("start");

        let note = JsonRpcNotification::new("notifications/initialized");
        client.send(vec![note.clone().into()]).await.expect("send");
        match rx.recv().await {
            Some(TransportEvent::Message(message)) => {
                assert_eq!(message, JsonRpcMessage::from(note))
            }
            other => panic!("unexpected event {other:?}"),
        }

        client.close().await.expect("close");
        assert!(matches!(rx.recv().await, Some(TransportEvent::Closed)));
        assert!(client.send(Vec::new()).await.is_err());
    }
}
