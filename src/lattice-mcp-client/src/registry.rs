//! Registry of named MCP server connections.
//!
//! Owns the live connection, the configuration and the discovered tool,
//! prompt and resource catalogs of every server, all keyed by server id.
//! Catalogs are refreshed on connect and by the explicit `list_*` calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lattice_mcp_types::{
    CallToolResult, GetPromptResult, Prompt, ReadResourceResult, Resource, Tool,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::{DEFAULT_REQUEST_TIMEOUT_SECS, McpConfig, ServerConfig};
use crate::error::{McpError, Result};
use crate::peer::ServerConnection;
use crate::transport::{DefaultTransportFactory, TransportFactory};

/// Result envelope of every tool invocation.
pub type ToolCallResponse = CallToolResult;

/// A tool discovered on a connected server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    /// `"{server_id}:{name}"`.
    pub id: String,
    pub server_id: String,
    pub server_name: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

impl McpTool {
    pub fn from_tool(config: &ServerConfig, tool: Tool) -> Self {
        Self {
            id: format!("{}:{}", config.id, tool.name),
            server_id: config.id.clone(),
            server_name: config.display_name().to_string(),
            name: tool.name,
            description: tool.description,
            input_schema: tool.input_schema,
        }
    }
}

/// Identifies the target server of a call.
#[derive(Debug, Clone)]
pub enum ServerRef {
    /// A full configuration; registered on first use.
    Config(ServerConfig),
    /// The id of an already registered server.
    Id(String),
}

impl ServerRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Config(config) => &config.id,
            Self::Id(id) => id,
        }
    }
}

impl From<ServerConfig> for ServerRef {
    fn from(config: ServerConfig) -> Self {
        Self::Config(config)
    }
}

impl From<&ServerConfig> for ServerRef {
    fn from(config: &ServerConfig) -> Self {
        Self::Config(config.clone())
    }
}

impl From<&str> for ServerRef {
    fn from(id: &str) -> Self {
        Self::Id(id.to_string())
    }
}

impl From<String> for ServerRef {
    fn from(id: String) -> Self {
        Self::Id(id)
    }
}

/// A tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub server: ServerRef,
    pub name: String,
    pub args: Map<String, Value>,
}

impl ToolCallRequest {
    pub fn new(server: impl Into<ServerRef>, name: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            name: name.into(),
            args: Map::new(),
        }
    }

    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        self.args = args;
        self
    }
}

/// Result of resolving a server by id or name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandle {
    pub id: String,
    pub name: String,
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    ServerConnected { server_id: String, tool_count: usize },
    ServerDisconnected { server_id: String },
    ConnectionFailed { server_id: String, error: String },
}

/// Named MCP server connections with cached catalogs.
///
/// Shared by `Arc`; every method takes `&self`.
pub struct ConnectionRegistry {
    factory: Arc<dyn TransportFactory>,
    request_timeout: Duration,
    configs: RwLock<HashMap<String, ServerConfig>>,
    connections: RwLock<HashMap<String, Arc<ServerConnection>>>,
    tools: RwLock<HashMap<String, Vec<McpTool>>>,
    prompts: RwLock<HashMap<String, Vec<Prompt>>>,
    resources: RwLock<HashMap<String, Vec<Resource>>>,
    /// Serializes connects so concurrent callers share one transport.
    connect_lock: Mutex<()>,
    events: Option<mpsc::UnboundedSender<LifecycleEvent>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_factory(Arc::new(DefaultTransportFactory::default()))
    }

    pub fn with_factory(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            configs: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            tools: RwLock::new(HashMap::new()),
            prompts: RwLock::new(HashMap::new()),
            resources: RwLock::new(HashMap::new()),
            connect_lock: Mutex::new(()),
            events: None,
        }
    }

    /// Registry with every server of `config` registered but not connected.
    pub fn from_config(config: &McpConfig) -> Self {
        let factory = Arc::new(DefaultTransportFactory::new(config.reconnect.clone()));
        let mut registry =
            Self::with_factory(factory).with_request_timeout(config.request_timeout());
        let configs = config
            .servers
            .iter()
            .map(|server| (server.id.clone(), server.clone()))
            .collect();
        registry.configs = RwLock::new(configs);
        registry
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Deliver lifecycle events on `sender`.
    pub fn with_event_sender(mut self, sender: mpsc::UnboundedSender<LifecycleEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    fn emit(&self, event: LifecycleEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Register a server without connecting; it connects on first use.
    pub async fn register_server(&self, config: ServerConfig) {
        self.configs.write().await.insert(config.id.clone(), config);
    }

    /// Connect to a server. Returns `true` once the server is connected,
    /// immediately if it already was, and `false` on any failure.
    pub async fn connect(&self, config: &ServerConfig) -> bool {
        match self.ensure_connected(config).await {
            Ok(_) => true,
            Err(e) => {
                error!(server_id = %config.id, error = %e, "Failed to connect to MCP server");
                false
            }
        }
    }

    async fn ensure_connected(&self, config: &ServerConfig) -> Result<Arc<ServerConnection>> {
        let _guard = self.connect_lock.lock().await;
        if let Some(existing) = self.connection(&config.id).await {
            debug!(server_id = %config.id, "Already connected");
            return Ok(existing);
        }
        self.configs
            .write()
            .await
            .insert(config.id.clone(), config.clone());

        match self.open(config).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                self.emit(LifecycleEvent::ConnectionFailed {
                    server_id: config.id.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn open(&self, config: &ServerConfig) -> Result<Arc<ServerConnection>> {
        config.validate()?;
        info!(
            server_id = %config.id,
            transport = %config.transport_kind,
            "Connecting to MCP server"
        );

        let transport = self.factory.create(config)?;
        let connection =
            ServerConnection::establish(config.id.clone(), transport, self.request_timeout).await?;

        let tools = if connection.capabilities().has_tools() {
            match connection.list_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    connection.close().await;
                    return Err(e);
                }
            }
        } else {
            Vec::new()
        };
        let tools: Vec<McpTool> = tools
            .into_iter()
            .map(|tool| McpTool::from_tool(config, tool))
            .collect();
        let tool_count = tools.len();

        if connection.capabilities().has_prompts() {
            match connection.list_prompts().await {
                Ok(prompts) => {
                    self.prompts.write().await.insert(config.id.clone(), prompts);
                }
                Err(e) => warn!(server_id = %config.id, error = %e, "Prompt discovery failed"),
            }
        }
        if connection.capabilities().has_resources() {
            match connection.list_resources().await {
                Ok(resources) => {
                    self.resources
                        .write()
                        .await
                        .insert(config.id.clone(), resources);
                }
                Err(e) => warn!(server_id = %config.id, error = %e, "Resource discovery failed"),
            }
        }

        let connection = Arc::new(connection);
        self.tools.write().await.insert(config.id.clone(), tools);
        self.connections
            .write()
            .await
            .insert(config.id.clone(), connection.clone());

        info!(server_id = %config.id, tool_count, "Connected to MCP server");
        self.emit(LifecycleEvent::ServerConnected {
            server_id: config.id.clone(),
            tool_count,
        });
        Ok(connection)
    }

    /// Close a server's connection and forget everything known about it.
    pub async fn disconnect(&self, server_id: &str) {
        let connection = self.connections.write().await.remove(server_id);
        self.tools.write().await.remove(server_id);
        self.prompts.write().await.remove(server_id);
        self.resources.write().await.remove(server_id);
        self.configs.write().await.remove(server_id);

        if let Some(connection) = connection {
            connection.close().await;
            info!(%server_id, "Disconnected from MCP server");
            self.emit(LifecycleEvent::ServerDisconnected {
                server_id: server_id.to_string(),
            });
        }
    }

    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.configs.read().await.keys().cloned().collect();
        for id in ids {
            self.disconnect(&id).await;
        }
    }

    pub async fn is_connected(&self, server_id: &str) -> bool {
        self.connection(server_id).await.is_some()
    }

    pub async fn connected_servers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .connections
            .read()
            .await
            .iter()
            .filter(|(_, connection)| !connection.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// The live connection of a server. A connection whose transport has
    /// closed is evicted so the next connect opens a fresh one.
    async fn connection(&self, server_id: &str) -> Option<Arc<ServerConnection>> {
        let connection = self.connections.read().await.get(server_id).cloned()?;
        if !connection.is_closed() {
            return Some(connection);
        }
        self.evict_closed(server_id).await;
        None
    }

    async fn evict_closed(&self, server_id: &str) {
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(server_id) {
                Some(connection) if connection.is_closed() => connections.remove(server_id),
                _ => None,
            }
        };
        let Some(connection) = removed else {
            return;
        };

        self.tools.write().await.remove(server_id);
        self.prompts.write().await.remove(server_id);
        self.resources.write().await.remove(server_id);
        connection.close().await;
        warn!(%server_id, "Connection to MCP server lost");
        self.emit(LifecycleEvent::ServerDisconnected {
            server_id: server_id.to_string(),
        });
    }

    async fn require_connection(&self, server_id: &str) -> Result<Arc<ServerConnection>> {
        self.connection(server_id)
            .await
            .ok_or_else(|| McpError::NotConnected(server_id.to_string()))
    }

    /// Registered configuration of a server.
    pub async fn server_config(&self, server_id: &str) -> Option<ServerConfig> {
        self.configs.read().await.get(server_id).cloned()
    }

    /// Look a registered server up by id, then by name.
    pub async fn resolve_server(&self, id_or_name: &str) -> Option<ServerHandle> {
        let configs = self.configs.read().await;
        configs
            .get(id_or_name)
            .or_else(|| configs.values().find(|c| c.name == id_or_name))
            .map(|c| ServerHandle {
                id: c.id.clone(),
                name: c.display_name().to_string(),
            })
    }

    /// Fetch the tool list from the server and replace the cached one.
    /// Connects first if needed.
    pub async fn list_tools(&self, config: &ServerConfig) -> Result<Vec<McpTool>> {
        let connection = self.ensure_connected(config).await?;
        let tools: Vec<McpTool> = connection
            .list_tools()
            .await?
            .into_iter()
            .map(|tool| McpTool::from_tool(config, tool))
            .collect();
        self.tools
            .write()
            .await
            .insert(config.id.clone(), tools.clone());
        Ok(tools)
    }

    /// Every cached tool of every connected server.
    pub async fn get_all_tools(&self) -> Vec<McpTool> {
        let tools = self.tools.read().await;
        let mut ids: Vec<&String> = tools.keys().collect();
        ids.sort();
        ids.into_iter()
            .flat_map(|id| tools[id].iter().cloned())
            .collect()
    }

    pub async fn find_tool_by_id(&self, tool_id: &str) -> Option<McpTool> {
        let (server_id, _) = tool_id.split_once(':')?;
        self.tools
            .read()
            .await
            .get(server_id)?
            .iter()
            .find(|tool| tool.id == tool_id)
            .cloned()
    }

    pub async fn find_tool(&self, server_id: &str, name: &str) -> Option<McpTool> {
        self.tools
            .read()
            .await
            .get(server_id)?
            .iter()
            .find(|tool| tool.name == name)
            .cloned()
    }

    /// Invoke a tool, connecting to its server first if needed.
    ///
    /// Every invocation failure comes back as an error result; only an
    /// unknown server or an invalid configuration is returned as `Err`.
    pub async fn call_tool(&self, request: ToolCallRequest) -> Result<ToolCallResponse> {
        let ToolCallRequest { server, name, args } = request;
        let config = match server {
            ServerRef::Config(config) => config,
            ServerRef::Id(id) => self
                .server_config(&id)
                .await
                .ok_or(McpError::UnknownServer(id))?,
        };

        let connection = match self.connection(&config.id).await {
            Some(connection) => connection,
            None => match self.ensure_connected(&config).await {
                Ok(connection) => connection,
                Err(e) if e.is_config() => return Err(e),
                Err(e) => {
                    warn!(server_id = %config.id, tool = %name, error = %e, "Lazy connect failed");
                    return Ok(CallToolResult::error(format!(
                        "Failed to connect to server {}: {e}",
                        config.display_name()
                    )));
                }
            },
        };

        debug!(server_id = %config.id, tool = %name, "Calling tool");
        match connection.call_tool(&name, args).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(server_id = %config.id, tool = %name, error = %e, "Tool call failed");
                Ok(CallToolResult::error(format!("Error calling tool {name}: {e}")))
            }
        }
    }

    /// Fetch the prompt list of a connected server and refresh the cache.
    pub async fn list_prompts(&self, server_id: &str) -> Result<Vec<Prompt>> {
        let connection = self.require_connection(server_id).await?;
        let prompts = connection.list_prompts().await?;
        self.prompts
            .write()
            .await
            .insert(server_id.to_string(), prompts.clone());
        Ok(prompts)
    }

    pub async fn get_prompt(
        &self,
        server_id: &str,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult> {
        self.require_connection(server_id)
            .await?
            .get_prompt(name, arguments)
            .await
    }

    /// Fetch the resource list of a connected server and refresh the cache.
    pub async fn list_resources(&self, server_id: &str) -> Result<Vec<Resource>> {
        let connection = self.require_connection(server_id).await?;
        let resources = connection.list_resources().await?;
        self.resources
            .write()
            .await
            .insert(server_id.to_string(), resources.clone());
        Ok(resources)
    }

    pub async fn get_resource(&self, server_id: &str, uri: &str) -> Result<ReadResourceResult> {
        self.require_connection(server_id)
            .await?
            .read_resource(uri)
            .await
    }

    /// Cached prompts of every connected server, tagged with the server id.
    pub async fn get_all_prompts(&self) -> Vec<(String, Prompt)> {
        let prompts = self.prompts.read().await;
        let mut all: Vec<(String, Prompt)> = prompts
            .iter()
            .flat_map(|(id, list)| list.iter().map(|p| (id.clone(), p.clone())))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Cached resources of every connected server, tagged with the server id.
    pub async fn get_all_resources(&self) -> Vec<(String, Resource)> {
        let resources = self.resources.read().await;
        let mut all: Vec<(String, Resource)> = resources
            .iter()
            .flat_map(|(id, list)| list.iter().map(|r| (id.clone(), r.clone())))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
