//! JSON-RPC client peer over a single transport.
//!
//! [`ServerConnection::establish`] starts the transport, runs the
//! `initialize` handshake and then correlates responses to requests by id.
//! Server-initiated requests are answered here: `ping` gets an empty result,
//! anything else gets `method not found`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use lattice_mcp_types::{
    CallToolParams, CallToolResult, GetPromptParams, GetPromptResult, InitializeParams,
    InitializeResult, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, ListPromptsResult, ListResourcesResult, ListToolsResult, Prompt,
    ReadResourceParams, ReadResourceResult, RequestId, Resource, SUPPORTED_PROTOCOL_VERSIONS,
    ServerCapabilities, Tool, methods,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{McpError, Result};
use crate::transport::{Transport, TransportEvent};

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>>;

/// An initialized session with one MCP server.
pub struct ServerConnection {
    server_id: String,
    transport: Arc<dyn Transport>,
    pending: PendingMap,
    next_id: AtomicI64,
    timeout: Duration,
    initialize: InitializeResult,
    /// Set once the transport is gone; the session cannot be used again.
    closed: Arc<AtomicBool>,
    dispatcher: JoinHandle<()>,
}

impl ServerConnection {
    /// Start `transport`, perform the handshake and return the live session.
    ///
    /// On failure the transport is closed before the error is returned.
    pub async fn establish(
        server_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        timeout: Duration,
    ) -> Result<Self> {
        let server_id = server_id.into();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Err(e) = transport.start(events_tx).await {
            if let Err(close_err) = transport.close().await {
                debug!(
                    %server_id,
                    error = %close_err,
                    "Error closing transport after failed start"
                );
            }
            return Err(e);
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let dispatcher = tokio::spawn(dispatch(
            server_id.clone(),
            events_rx,
            pending.clone(),
            closed.clone(),
            transport.clone(),
        ));

        let mut connection = Self {
            server_id,
            transport,
            pending,
            next_id: AtomicI64::new(1),
            timeout,
            initialize: InitializeResult {
                protocol_version: String::new(),
                capabilities: ServerCapabilities::default(),
                server_info: Default::default(),
                instructions: None,
            },
            closed,
            dispatcher,
        };

        match connection.handshake().await {
            Ok(result) => {
                connection.initialize = result;
                Ok(connection)
            }
            Err(e) => {
                connection.close().await;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<InitializeResult> {
        let params = serde_json::to_value(InitializeParams::default())?;
        let result: InitializeResult = self.request(methods::INITIALIZE, Some(params)).await?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            warn!(
                server_id = %self.server_id,
                version = %result.protocol_version,
                "Server negotiated an unrecognized protocol version"
            );
        }

        self.notify(methods::INITIALIZED, None).await?;
        info!(
            server_id = %self.server_id,
            server = %result.server_info.name,
            version = %result.protocol_version,
            "MCP session initialized"
        );
        Ok(result)
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// The server's `initialize` result.
    pub fn initialize_result(&self) -> &InitializeResult {
        &self.initialize
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.initialize.capabilities
    }

    /// Whether the transport has closed, from either side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Session id assigned by the server, for transports that have one.
    pub fn session_id(&self) -> Option<String> {
        self.transport.session_id()
    }

    /// Send a request and wait for its result.
    ///
    /// On timeout the request is abandoned and `notifications/cancelled` is
    /// sent so the server can stop working on it.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        let mut request = JsonRpcRequest::new(id.clone(), method);
        if let Some(params) = params {
            request = request.with_params(params);
        }
        trace!(server_id = %self.server_id, %id, method, "Sending request");

        if let Err(e) = self.transport.send(vec![request.into()]).await {
            self.pending.lock().remove(&id);
            if matches!(e, McpError::Closed) {
                self.closed.store(true, Ordering::SeqCst);
            }
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => {
                let value = response.into_result()?;
                Ok(serde_json::from_value(value)?)
            }
            Ok(Err(_)) => Err(McpError::Closed),
            Err(_) => {
                self.pending.lock().remove(&id);
                warn!(server_id = %self.server_id, %id, method, "Request timed out");
                let cancelled = json!({"requestId": id, "reason": "timeout"});
                if let Err(e) = self.notify(methods::CANCELLED, Some(cancelled)).await {
                    debug!(server_id = %self.server_id, error = %e, "Failed to send cancellation");
                }
                Err(McpError::Timeout(self.timeout))
            }
        }
    }

    /// Send a notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let mut notification = JsonRpcNotification::new(method);
        if let Some(params) = params {
            notification = notification.with_params(params);
        }
        self.transport.send(vec![notification.into()]).await
    }

    pub async fn ping(&self) -> Result<()> {
        let _: Value = self.request(methods::PING, None).await?;
        Ok(())
    }

    /// All tools, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor = None;
        loop {
            let page: ListToolsResult = self
                .request(methods::TOOLS_LIST, cursor_params(cursor))
                .await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        self.request(methods::TOOLS_CALL, Some(serde_json::to_value(params)?))
            .await
    }

    /// All prompts, following pagination cursors.
    pub async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        let mut prompts = Vec::new();
        let mut cursor = None;
        loop {
            let page: ListPromptsResult =
                self.request(methods::PROMPTS_LIST, cursor_params(cursor)).await?;
            prompts.extend(page.prompts);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(prompts),
            }
        }
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult> {
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        self.request(methods::PROMPTS_GET, Some(serde_json::to_value(params)?))
            .await
    }

    /// All resources, following pagination cursors.
    pub async fn list_resources(&self) -> Result<Vec<Resource>> {
        let mut resources = Vec::new();
        let mut cursor = None;
        loop {
            let page: ListResourcesResult =
                self.request(methods::RESOURCES_LIST, cursor_params(cursor)).await?;
            resources.extend(page.resources);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(resources),
            }
        }
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        self.request(methods::RESOURCES_READ, Some(serde_json::to_value(params)?))
            .await
    }

    /// Close the transport and fail every outstanding request.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Err(e) = self.transport.close().await {
            warn!(server_id = %self.server_id, error = %e, "Error closing transport");
        }
        self.dispatcher.abort();
        self.pending.lock().clear();
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

fn cursor_params(cursor: Option<String>) -> Option<Value> {
    cursor.map(|cursor| json!({ "cursor": cursor }))
}

/// Route transport events until the transport closes.
async fn dispatch(
    server_id: String,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    transport: Arc<dyn Transport>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(JsonRpcMessage::Response(response)) => {
                let waiter = pending.lock().remove(&response.id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => debug!(%server_id, id = %response.id, "Response for unknown request"),
                }
            }
            TransportEvent::Message(JsonRpcMessage::Request(request)) => {
                let reply = if request.method == methods::PING {
                    JsonRpcResponse::success(request.id, json!({}))
                } else {
                    debug!(%server_id, method = %request.method, "Unsupported server request");
                    JsonRpcResponse::error(
                        request.id,
                        JsonRpcError::method_not_found(&request.method),
                    )
                };
                if let Err(e) = transport.send(vec![reply.into()]).await {
                    warn!(%server_id, error = %e, "Failed to answer server request");
                }
            }
            TransportEvent::Message(JsonRpcMessage::Notification(notification)) => {
                if methods::is_list_changed(&notification.method) {
                    info!(%server_id, method = %notification.method, "Server catalog changed");
                } else {
                    debug!(%server_id, method = %notification.method, "Server notification");
                }
            }
            TransportEvent::Error(e) => {
                warn!(%server_id, error = %e, "Transport error");
            }
            TransportEvent::Closed => {
                debug!(%server_id, "Transport closed");
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    pending.lock().clear();
}
