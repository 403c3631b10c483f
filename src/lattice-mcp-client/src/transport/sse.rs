//! Legacy HTTP+SSE transport.
//!
//! The client holds one GET event stream open. The server's first `endpoint`
//! event names the URL that outbound messages are POSTed to, one message per
//! request; every response arrives back on the stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lattice_mcp_types::JsonRpcMessage;
use parking_lot::{Mutex, RwLock};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::endpoint::{HttpEndpoint, SessionState, status_error};
use super::sse_stream::pump_sse;
use super::{EventSink, Transport, TransportEvent, emit};
use crate::auth::OAuthClientProvider;
use crate::error::{McpError, Result};

/// How long to wait for the server's `endpoint` event.
pub const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SseTransport {
    endpoint: HttpEndpoint,
    state: Arc<SessionState>,
    post_url: RwLock<Option<Url>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    pub fn new(client: Client, url: Url) -> Self {
        Self {
            endpoint: HttpEndpoint::new(client, url),
            state: Arc::new(SessionState::default()),
            post_url: RwLock::new(None),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.endpoint.headers.extend(headers);
        self
    }

    pub fn with_auth_provider(mut self, provider: Arc<dyn OAuthClientProvider>) -> Self {
        self.endpoint.auth = Some(provider);
        self
    }

    /// URL announced by the server for outbound messages.
    pub fn post_url(&self) -> Option<Url> {
        self.post_url.read().clone()
    }

    async fn open_stream(&self) -> Result<reqwest::Response> {
        let mut retried = false;
        loop {
            let response = self
                .endpoint
                .request(Method::GET, &self.endpoint.url, &self.state)
                .await
                .header(ACCEPT, "text/event-stream")
                .send()
                .await?;

            match response.status() {
                status if status.is_success() => return Ok(response),
                StatusCode::UNAUTHORIZED if !retried && self.endpoint.can_authorize() => {
                    self.endpoint.authorize().await?;
                    retried = true;
                }
                _ => return Err(status_error(response).await),
            }
        }
    }

    /// Stop the stream reader, if one is running.
    fn stop_stream(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    async fn await_endpoint(&self, announced: oneshot::Receiver<Url>) -> Result<Url> {
        let announced = tokio::select! {
            _ = self.cancel.cancelled() => return Err(McpError::Closed),
            announced = tokio::time::timeout(ENDPOINT_TIMEOUT, announced) => announced,
        };
        let url = match announced {
            Ok(Ok(url)) => url,
            Ok(Err(_)) => return Err(McpError::transport("SSE stream ended before endpoint event")),
            Err(_) => return Err(McpError::Timeout(ENDPOINT_TIMEOUT)),
        };
        if url.origin() != self.endpoint.url.origin() {
            return Err(McpError::transport(format!(
                "endpoint origin {} does not match server {}",
                url.origin().ascii_serialization(),
                self.endpoint.url.origin().ascii_serialization()
            )));
        }
        Ok(url)
    }

    async fn post_one(&self, url: &Url, body: Vec<u8>) -> Result<()> {
        let mut retried = false;
        loop {
            let request = self
                .endpoint
                .request(Method::POST, url, &self.state)
                .await
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone());
            let response = tokio::select! {
                _ = self.cancel.cancelled() => return Err(McpError::Closed),
                response = request.send() => response?,
            };

            match response.status() {
                status if status.is_success() => return Ok(()),
                StatusCode::UNAUTHORIZED if !retried && self.endpoint.can_authorize() => {
                    self.endpoint.authorize().await?;
                    retried = true;
                }
                _ => return Err(status_error(response).await),
            }
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn start(&self, sink: EventSink) -> Result<()> {
        self.state.set_sink(sink.clone());
        let response = match self.open_stream().await {
            Ok(response) => response,
            Err(e) => {
                emit(&sink, TransportEvent::Error(e.duplicate()));
                return Err(e);
            }
        };

        let (endpoint_tx, endpoint_rx) = oneshot::channel::<Url>();
        let base = self.endpoint.url.clone();
        let state = self.state.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let on_event = |event: &eventsource_stream::Event| {
                if event.event != "endpoint" {
                    return;
                }
                match base.join(event.data.trim()) {
                    Ok(url) => {
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(url);
                        }
                    }
                    Err(e) => warn!(data = %event.data, error = %e, "Invalid endpoint event"),
                }
            };
            let stream = response.bytes_stream();
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = pump_sse(stream, &state.last_event_id, &sink, on_event) => result,
            };
            if let Err(e) = result {
                warn!(error = %e, "SSE stream dropped");
                emit(&sink, TransportEvent::Error(e));
            }
            emit(&sink, TransportEvent::Closed);
        });
        *self.task.lock() = Some(handle);

        match self.await_endpoint(endpoint_rx).await {
            Ok(url) => {
                debug!(%url, "SSE endpoint announced");
                *self.post_url.write() = Some(url);
                Ok(())
            }
            Err(e) => {
                self.stop_stream();
                Err(e)
            }
        }
    }

    async fn send(&self, messages: Vec<JsonRpcMessage>) -> Result<()> {
        let url = self
            .post_url()
            .ok_or_else(|| McpError::transport("transport not started"))?;
        for message in &messages {
            let body = serde_json::to_vec(message)?;
            if let Err(e) = self.post_one(&url, body).await {
                self.state.emit(TransportEvent::Error(e.duplicate()));
                return Err(e);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.stop_stream();
        *self.post_url.write() = None;
        if let Some(sink) = self.state.take_sink() {
            emit(&sink, TransportEvent::Closed);
        }
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn serve_endpoint(server: &MockServer, endpoint: &str) {
        let body = format!("event: endpoint\ndata: {endpoint}\n\n");
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(server)
            .await;
    }

    fn transport_for(server: &MockServer) -> SseTransport {
        let url = Url::parse(&format!("{}/sse", server.uri())).expect("url");
        SseTransport::new(Client::new(), url)
    }

    #[tokio::test]
    async fn test_relative_endpoint_is_resolved() {
        let server = MockServer::start().await;
        serve_endpoint(&server, "/messages?session=abc").await;

        let transport = transport_for(&server);
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.start(tx).await.expect("start");

        let url = transport.post_url().expect("post url");
        assert_eq!(url.path(), "/messages");
        assert_eq!(url.query(), Some("session=abc"));
        transport.close().await.expect("close");
    }

    #[tokio::test]
    async fn test_cross_origin_endpoint_stops_stream_reader() {
        let server = MockServer::start().await;
        serve_endpoint(&server, "http://elsewhere.invalid/messages").await;

        let transport = transport_for(&server);
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = transport.start(tx).await.unwrap_err();

        assert!(err.to_string().contains("does not match server"), "{err}");
        assert!(transport.cancel.is_cancelled());
        assert!(transport.task.lock().is_none());
        assert!(transport.post_url().is_none());
    }
}
