//! Streamable HTTP transport.
//!
//! Every outbound batch is POSTed to a single endpoint; the server answers
//! with JSON, with an SSE stream, or with `202 Accepted`. An optional
//! long-lived GET stream carries server-initiated messages and is resumed
//! with `Last-Event-ID` after a drop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lattice_mcp_types::JsonRpcMessage;
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, Response, StatusCode};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::endpoint::{
    HttpEndpoint, LAST_EVENT_ID_HEADER, SessionState, content_type, status_error,
};
use super::sse_stream::{dispatch_data, pump_sse};
use super::{EventSink, Transport, TransportEvent};
use crate::auth::OAuthClientProvider;
use crate::config::ReconnectConfig;
use crate::error::{McpError, Result};

const EVENT_STREAM: &str = "text/event-stream";
const POST_ACCEPT: &str = "application/json, text/event-stream";

/// Client side of the streamable HTTP transport.
pub struct StreamableHttpTransport {
    endpoint: HttpEndpoint,
    reconnect: ReconnectConfig,
    state: Arc<SessionState>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamableHttpTransport {
    pub fn new(client: Client, url: Url) -> Self {
        Self {
            endpoint: HttpEndpoint::new(client, url),
            reconnect: ReconnectConfig::default(),
            state: Arc::new(SessionState::default()),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Extra headers sent with every request.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.endpoint.headers.extend(headers);
        self
    }

    pub fn with_auth_provider(mut self, provider: Arc<dyn OAuthClientProvider>) -> Self {
        self.endpoint.auth = Some(provider);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Resume a GET stream from this event id on start.
    pub fn with_last_event_id(self, event_id: impl Into<String>) -> Self {
        *self.state.last_event_id.write() = Some(event_id.into());
        self
    }

    /// Id of the last SSE event received, if any.
    pub fn last_event_id(&self) -> Option<String> {
        self.state.last_event_id()
    }

    /// Complete an authorization that required a user redirect.
    pub async fn finish_auth(&self, code: &str) -> Result<()> {
        let provider = self.endpoint.auth.as_ref().ok_or_else(|| {
            McpError::Unauthorized("no authorization provider configured".to_string())
        })?;
        provider
            .finish_authorization(&self.endpoint.url, code)
            .await
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Report `err` on the event channel and hand it back to the caller.
    fn fail(&self, err: McpError) -> McpError {
        self.state.emit(TransportEvent::Error(err.duplicate()));
        err
    }

    async fn post(&self, body: Vec<u8>) -> Result<Response> {
        let mut retried = false;
        loop {
            let request = self
                .endpoint
                .request(Method::POST, &self.endpoint.url, &self.state)
                .await
                .header(CONTENT_TYPE, "application/json")
                .header(ACCEPT, POST_ACCEPT)
                .body(body.clone());

            let response = tokio::select! {
                _ = self.cancel.cancelled() => return Err(McpError::Closed),
                response = request.send() => response?,
            };
            self.state.capture_session(&response);

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && !retried && self.endpoint.can_authorize() {
                debug!(url = %self.endpoint.url, "POST unauthorized, re-authorizing");
                self.endpoint.authorize().await?;
                retried = true;
                continue;
            }
            if !status.is_success() {
                return Err(status_error(response).await);
            }
            return Ok(response);
        }
    }

    async fn handle_post_response(&self, response: Response, sink: EventSink) -> Result<()> {
        if response.status() == StatusCode::ACCEPTED {
            return Ok(());
        }

        let media_type = content_type(&response);
        if media_type == EVENT_STREAM {
            let state = self.state.clone();
            let cancel = self.cancel.clone();
            let handle = tokio::spawn(async move {
                let stream = response.bytes_stream();
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = pump_sse(stream, &state.last_event_id, &sink, |_| {}) => result,
                };
                if let Err(e) = result {
                    warn!(error = %e, "POST response stream failed");
                    super::emit(&sink, TransportEvent::Error(e));
                }
            });
            self.track(handle);
            return Ok(());
        }

        let body = response.text().await?;
        if media_type == "application/json" {
            dispatch_data(&body, &sink);
            Ok(())
        } else if body.trim().is_empty() {
            Ok(())
        } else {
            Err(McpError::transport(format!(
                "unexpected content type '{media_type}' in POST response"
            )))
        }
    }
}

/// Open the GET stream. `None` means the server does not offer one.
async fn open_get_stream(
    endpoint: &HttpEndpoint,
    state: &SessionState,
) -> Result<Option<Response>> {
    let mut retried = false;
    loop {
        let mut request = endpoint
            .request(Method::GET, &endpoint.url, state)
            .await
            .header(ACCEPT, EVENT_STREAM);
        if let Some(event_id) = state.last_event_id() {
            request = request.header(LAST_EVENT_ID_HEADER, event_id);
        }

        let response = request.send().await?;
        state.capture_session(&response);

        match response.status() {
            status if status.is_success() => return Ok(Some(response)),
            StatusCode::METHOD_NOT_ALLOWED => return Ok(None),
            StatusCode::UNAUTHORIZED if !retried && endpoint.can_authorize() => {
                debug!(url = %endpoint.url, "GET unauthorized, re-authorizing");
                endpoint.authorize().await?;
                retried = true;
            }
            _ => return Err(status_error(response).await),
        }
    }
}

/// Drive the GET stream, reconnecting with backoff after it fails.
async fn run_get_stream(
    endpoint: HttpEndpoint,
    state: Arc<SessionState>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
    sink: EventSink,
    first: Response,
) {
    let mut response = Some(first);
    let mut attempt = 0u32;

    loop {
        let current = match response.take() {
            Some(current) => current,
            None => {
                if !reconnect.enabled || attempt >= reconnect.max_attempts {
                    warn!(url = %endpoint.url, attempts = attempt, "Giving up on GET stream");
                    super::emit(
                        &sink,
                        TransportEvent::Error(McpError::transport(
                            "GET stream lost and reconnect attempts exhausted",
                        )),
                    );
                    return;
                }
                let delay = reconnect.delay_for_attempt(attempt);
                attempt += 1;
                debug!(attempt, ?delay, "Reconnecting GET stream");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                let reopened = tokio::select! {
                    _ = cancel.cancelled() => return,
                    reopened = open_get_stream(&endpoint, &state) => reopened,
                };
                match reopened {
                    Ok(Some(reopened)) => {
                        attempt = 0;
                        reopened
                    }
                    Ok(None) => return,
                    Err(e) => {
                        super::emit(&sink, TransportEvent::Error(e));
                        continue;
                    }
                }
            }
        };

        let stream = current.bytes_stream();
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = pump_sse(stream, &state.last_event_id, &sink, |_| {}) => result,
        };
        match result {
            Ok(()) => {
                debug!(url = %endpoint.url, "GET stream ended by server");
                return;
            }
            Err(e) => {
                warn!(url = %endpoint.url, error = %e, "GET stream dropped");
                super::emit(&sink, TransportEvent::Error(e));
            }
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn start(&self, sink: EventSink) -> Result<()> {
        self.state.set_sink(sink.clone());

        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return Err(McpError::Closed),
            opened = open_get_stream(&self.endpoint, &self.state) => opened,
        };
        match opened {
            Ok(None) => {
                debug!(url = %self.endpoint.url, "Server offers no GET stream");
                Ok(())
            }
            Ok(Some(response)) => {
                info!(url = %self.endpoint.url, "GET stream open");
                let handle = tokio::spawn(run_get_stream(
                    self.endpoint.clone(),
                    self.state.clone(),
                    self.reconnect.clone(),
                    self.cancel.clone(),
                    sink,
                    response,
                ));
                self.track(handle);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn send(&self, messages: Vec<JsonRpcMessage>) -> Result<()> {
        let sink = self
            .state
            .sink()
            .ok_or_else(|| McpError::transport("transport not started"))?;
        if self.cancel.is_cancelled() {
            return Err(McpError::Closed);
        }

        let body = serde_json::to_vec(&messages)?;
        let response = self.post(body).await.map_err(|e| self.fail(e))?;
        self.handle_post_response(response, sink)
            .await
            .map_err(|e| self.fail(e))
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }

        if let Some(session_id) = self.state.session_id() {
            let request = self
                .endpoint
                .request(Method::DELETE, &self.endpoint.url, &self.state)
                .await;
            match request.send().await {
                Ok(response)
                    if response.status().is_success()
                        || response.status() == StatusCode::METHOD_NOT_ALLOWED =>
                {
                    debug!(%session_id, "Session terminated");
                }
                Ok(response) => {
                    warn!(%session_id, status = %response.status(), "Session termination rejected");
                }
                Err(e) => warn!(%session_id, error = %e, "Session termination failed"),
            }
            self.state.take_session_id();
        }

        if let Some(sink) = self.state.take_sink() {
            super::emit(&sink, TransportEvent::Closed);
        }
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.state.session_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let transport = StreamableHttpTransport::new(
            Client::new(),
            Url::parse("http://127.0.0.1:9/mcp").expect("url"),
        );
        let message = lattice_mcp_types::JsonRpcNotification::new("notifications/initialized");
        assert!(transport.send(vec![message.into()]).await.is_err());
    }

    #[tokio::test]
    async fn test_close_without_session_emits_closed() {
        let transport = StreamableHttpTransport::new(
            Client::new(),
            Url::parse("http://127.0.0.1:9/mcp").expect("url"),
        );
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        transport.state.set_sink(tx);
        transport.close().await.expect("close");
        assert!(matches!(rx.recv().await, Some(TransportEvent::Closed)));
    }
}
