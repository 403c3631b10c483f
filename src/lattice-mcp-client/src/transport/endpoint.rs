//! Request plumbing shared by the HTTP transports.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use url::Url;

use super::{EventSink, TransportEvent, emit};
use crate::auth::{self, OAuthClientProvider};
use crate::error::{McpError, Result};

/// Header carrying the server-issued session id.
pub(crate) const SESSION_HEADER: &str = "mcp-session-id";

/// Header carrying the resumability checkpoint on GET.
pub(crate) const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Where and how to reach one HTTP server.
#[derive(Clone)]
pub(crate) struct HttpEndpoint {
    pub client: Client,
    pub url: Url,
    pub headers: HashMap<String, String>,
    pub auth: Option<Arc<dyn OAuthClientProvider>>,
}

impl HttpEndpoint {
    pub fn new(client: Client, url: Url) -> Self {
        Self {
            client,
            url,
            headers: HashMap::new(),
            auth: None,
        }
    }

    /// Request to `url` with the configured headers, session id and bearer token.
    pub async fn request(&self, method: Method, url: &Url, state: &SessionState) -> RequestBuilder {
        let mut request = self.client.request(method, url.clone());
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        let session_id = state.session_id();
        if let Some(session_id) = session_id {
            request = request.header(SESSION_HEADER, session_id);
        }
        if let Some(provider) = &self.auth {
            if let Some(tokens) = provider.tokens().await {
                request = request.bearer_auth(tokens.access_token);
            }
        }
        request
    }

    /// Whether a `401` can be answered with an authorization attempt.
    pub fn can_authorize(&self) -> bool {
        self.auth.is_some()
    }

    /// Run the provider's authorization for this server.
    pub async fn authorize(&self) -> Result<()> {
        match &self.auth {
            Some(provider) => auth::auth(provider.as_ref(), &self.url).await,
            None => Err(McpError::Unauthorized(format!(
                "{} requires authorization and no provider is configured",
                self.url
            ))),
        }
    }
}

/// Mutable per-transport state shared with background tasks.
#[derive(Default)]
pub(crate) struct SessionState {
    session_id: RwLock<Option<String>>,
    pub last_event_id: RwLock<Option<String>>,
    sink: RwLock<Option<EventSink>>,
}

impl SessionState {
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn take_session_id(&self) -> Option<String> {
        self.session_id.write().take()
    }

    /// Record the session id a response carries, if any.
    pub fn capture_session(&self, response: &Response) {
        let issued = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(issued) = issued {
            let mut current = self.session_id.write();
            if current.as_deref() != Some(issued.as_str()) {
                tracing::debug!(session_id = %issued, "Session established");
                *current = Some(issued);
            }
        }
    }

    pub fn last_event_id(&self) -> Option<String> {
        self.last_event_id.read().clone()
    }

    pub fn set_sink(&self, sink: EventSink) {
        *self.sink.write() = Some(sink);
    }

    pub fn sink(&self) -> Option<EventSink> {
        self.sink.read().clone()
    }

    pub fn take_sink(&self) -> Option<EventSink> {
        self.sink.write().take()
    }

    pub fn emit(&self, event: TransportEvent) {
        if let Some(sink) = self.sink() {
            emit(&sink, event);
        }
    }
}

/// Error for a non-success response, consuming its body for context.
pub(crate) async fn status_error(response: Response) -> McpError {
    let status = response.status();
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::UNAUTHORIZED {
        return McpError::Unauthorized(format!("{url} returned 401"));
    }
    McpError::Http {
        status: status.as_u16(),
        url,
        body,
    }
}

/// Lower-cased media type of a response, without parameters.
pub(crate) fn content_type(response: &Response) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default()
}
