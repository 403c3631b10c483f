//! In-process MCP server for tests.
//!
//! [`MockServer`] answers the handshake, catalog and tool requests over an
//! [`InMemoryTransport`]; [`MockTransportFactory`] hands a fresh mock to the
//! registry on every connect and counts how often it did.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use lattice_mcp_types::{
    CallToolParams, CallToolResult, Content, GetPromptParams, GetPromptResult, Implementation,
    InitializeResult, JsonRpcError, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, ListChanged,
    ListPromptsResult, ListResourcesResult, ListToolsResult, PROTOCOL_VERSION, Prompt,
    ReadResourceParams, ReadResourceResult, Resource, ServerCapabilities, Tool, methods,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::error::{McpError, Result};
use crate::transport::{InMemoryTransport, Transport, TransportEvent, TransportFactory};

/// Computes a tool result from its arguments.
pub type ToolHandler = Arc<dyn Fn(&Map<String, Value>) -> CallToolResult + Send + Sync>;

#[derive(Clone)]
enum ToolBehavior {
    Respond(ToolHandler),
    /// Never answer, to exercise request timeouts.
    Ignore,
    /// Close the connection instead of answering.
    Disconnect,
}

/// A `tools/call` the mock received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub name: String,
    pub arguments: Map<String, Value>,
}

/// Shared log of received tool calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<RecordedCall>>>);

impl CallLog {
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.0.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.0.lock().len()
    }

    pub fn names(&self) -> Vec<String> {
        self.0.lock().iter().map(|c| c.name.clone()).collect()
    }
}

/// Scriptable MCP server.
#[derive(Clone)]
pub struct MockServer {
    name: String,
    tools: Vec<(Tool, ToolBehavior)>,
    prompts: Vec<(Prompt, GetPromptResult)>,
    resources: Vec<(Resource, ReadResourceResult)>,
    reject_initialize: bool,
    log: CallLog,
}

impl MockServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
            prompts: Vec::new(),
            resources: Vec::new(),
            reject_initialize: false,
            log: CallLog::default(),
        }
    }

    /// Add a tool answered by `handler`.
    pub fn with_tool(
        mut self,
        tool: Tool,
        handler: impl Fn(&Map<String, Value>) -> CallToolResult + Send + Sync + 'static,
    ) -> Self {
        self.tools.push((tool, ToolBehavior::Respond(Arc::new(handler))));
        self
    }

    /// Add a tool whose result is the single text item `handler` returns.
    pub fn with_text_tool(
        self,
        tool: Tool,
        handler: impl Fn(&Map<String, Value>) -> String + Send + Sync + 'static,
    ) -> Self {
        self.with_tool(tool, move |args| {
            CallToolResult::success(vec![Content::text(handler(args))])
        })
    }

    /// Add a tool whose calls are never answered.
    pub fn with_unresponsive_tool(mut self, tool: Tool) -> Self {
        self.tools.push((tool, ToolBehavior::Ignore));
        self
    }

    pub fn with_prompt(mut self, prompt: Prompt, result: GetPromptResult) -> Self {
        self.prompts.push((prompt, result));
        self
    }

    pub fn with_resource(mut self, resource: Resource, result: ReadResourceResult) -> Self {
        self.resources.push((resource, result));
        self
    }

    /// Add a tool whose calls make the server hang up.
    pub fn with_disconnecting_tool(mut self, tool: Tool) -> Self {
        self.tools.push((tool, ToolBehavior::Disconnect));
        self
    }

    /// Answer `initialize` with an error.
    pub fn reject_initialize(mut self) -> Self {
        self.reject_initialize = true;
        self
    }

    /// Log of the tool calls this server will receive.
    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }

    /// Start serving and return the client end of the connection.
    pub fn serve(self) -> InMemoryTransport {
        let (client, server) = InMemoryTransport::pair();
        tokio::spawn(self.run(server));
        client
    }

    async fn run(self, transport: InMemoryTransport) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        if transport.start(tx).await.is_err() {
            return;
        }
        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::Message(JsonRpcMessage::Request(request)) => {
                    if self.disconnects_on(&request) {
                        let _ = transport.close().await;
                        break;
                    }
                    if let Some(response) = self.handle(request) {
                        if transport.send(vec![response.into()]).await.is_err() {
                            break;
                        }
                    }
                }
                TransportEvent::Closed => break,
                _ => {}
            }
        }
    }

    fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        let params = request.params.unwrap_or(Value::Null);
        let result = match request.method.as_str() {
            methods::INITIALIZE if self.reject_initialize => {
                Err(JsonRpcError::internal_error("initialization refused"))
            }
            methods::INITIALIZE => to_value(InitializeResult {
                protocol_version: PROTOCOL_VERSION.to_string(),
                capabilities: self.capabilities(),
                server_info: Implementation::new(&self.name, "0.0.0"),
                instructions: None,
            }),
            methods::PING => Ok(Value::Object(Map::new())),
            methods::TOOLS_LIST => to_value(ListToolsResult {
                tools: self.tools.iter().map(|(tool, _)| tool.clone()).collect(),
                next_cursor: None,
            }),
            methods::TOOLS_CALL => match self.call_tool(params) {
                Some(result) => result,
                None => return None,
            },
            methods::PROMPTS_LIST => to_value(ListPromptsResult {
                prompts: self.prompts.iter().map(|(p, _)| p.clone()).collect(),
                next_cursor: None,
            }),
            methods::PROMPTS_GET => serde_json::from_value::<GetPromptParams>(params)
                .map_err(|e| JsonRpcError::invalid_params(e.to_string()))
                .and_then(|params| {
                    self.prompts
                        .iter()
                        .find(|(p, _)| p.name == params.name)
                        .ok_or_else(|| {
                            JsonRpcError::invalid_params(format!("Unknown prompt: {}", params.name))
                        })
                        .and_then(|(_, result)| to_value(result))
                }),
            methods::RESOURCES_LIST => to_value(ListResourcesResult {
                resources: self.resources.iter().map(|(r, _)| r.clone()).collect(),
                next_cursor: None,
            }),
            methods::RESOURCES_READ => serde_json::from_value::<ReadResourceParams>(params)
                .map_err(|e| JsonRpcError::invalid_params(e.to_string()))
                .and_then(|params| {
                    self.resources
                        .iter()
                        .find(|(r, _)| r.uri == params.uri)
                        .ok_or_else(|| {
                            let message = format!("Unknown resource: {}", params.uri);
                            JsonRpcError::invalid_params(message)
                        })
                        .and_then(|(_, result)| to_value(result))
                }),
            other => Err(JsonRpcError::method_not_found(other)),
        };

        Some(match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(error) => JsonRpcResponse::error(id, error),
        })
    }

    fn call_tool(&self, params: Value) -> Option<std::result::Result<Value, JsonRpcError>> {
        let params: CallToolParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => return Some(Err(JsonRpcError::invalid_params(e.to_string()))),
        };
        self.log.0.lock().push(RecordedCall {
            name: params.name.clone(),
            arguments: params.arguments.clone(),
        });

        match self.tools.iter().find(|(tool, _)| tool.name == params.name) {
            Some((_, ToolBehavior::Respond(handler))) => Some(to_value(handler(&params.arguments))),
            Some((_, ToolBehavior::Ignore | ToolBehavior::Disconnect)) => None,
            None => Some(Err(JsonRpcError::invalid_params(format!(
                "Unknown tool: {}",
                params.name
            )))),
        }
    }

    fn disconnects_on(&self, request: &JsonRpcRequest) -> bool {
        if request.method != methods::TOOLS_CALL {
            return false;
        }
        let name = request
            .params
            .as_ref()
            .and_then(|params| params.get("name"))
            .and_then(Value::as_str);
        self.tools
            .iter()
            .filter(|(_, behavior)| matches!(behavior, ToolBehavior::Disconnect))
            .any(|(tool, _)| Some(tool.name.as_str()) == name)
    }

    fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: Some(ListChanged::default()),
            prompts: (!self.prompts.is_empty()).then(ListChanged::default),
            resources: (!self.resources.is_empty()).then(ListChanged::default),
            logging: None,
        }
    }
}

fn to_value(value: impl Serialize) -> std::result::Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal_error(e.to_string()))
}

type ServerBuilder = Arc<dyn Fn() -> MockServer + Send + Sync>;

/// Transport factory serving a fresh [`MockServer`] per connect.
#[derive(Default)]
pub struct MockTransportFactory {
    servers: HashMap<String, ServerBuilder>,
    created: Mutex<HashMap<String, usize>>,
    total: AtomicUsize,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `server_id` with mocks built by `build`.
    pub fn with_server(
        mut self,
        server_id: impl Into<String>,
        build: impl Fn() -> MockServer + Send + Sync + 'static,
    ) -> Self {
        self.servers.insert(server_id.into(), Arc::new(build));
        self
    }

    /// How many transports were created for `server_id`.
    pub fn created(&self, server_id: &str) -> usize {
        self.created.lock().get(server_id).copied().unwrap_or(0)
    }

    /// How many transports were created in total.
    pub fn total_created(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, config: &ServerConfig) -> Result<Arc<dyn Transport>> {
        let build = self.servers.get(&config.id).ok_or_else(|| {
            McpError::config(format!("no mock server registered for '{}'", config.id))
        })?;
        *self.created.lock().entry(config.id.clone()).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(build().serve()))
    }
}
