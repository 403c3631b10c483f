//! Message transports.
//!
//! A [`Transport`] moves [`JsonRpcMessage`]s to a server. Inbound messages,
//! non-fatal errors and closure are delivered on the [`EventSink`] passed to
//! [`Transport::start`].

mod endpoint;
pub mod memory;
pub mod sse;
pub(crate) mod sse_stream;
pub mod stdio;
pub mod streamable_http;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lattice_mcp_types::JsonRpcMessage;
use parking_lot::Mutex;
use reqwest::Client;
use tokio::sync::mpsc;
use tracing::warn;

use crate::auth::{OAuthClientProvider, StaticTokenProvider};
use crate::config::{ReconnectConfig, ServerConfig, TransportKind};
use crate::error::{McpError, Result};
use crate::http_client::create_streaming_client;

pub use memory::InMemoryTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpTransport;

/// Something a transport reports to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// A validated inbound message.
    Message(JsonRpcMessage),
    /// A non-fatal error: malformed message, dropped stream, failed reconnect.
    Error(McpError),
    /// The transport is closed; no further events follow.
    Closed,
}

/// Channel a transport delivers its events on.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Sends an event, ignoring a dropped receiver.
pub(crate) fn emit(sink: &EventSink, event: TransportEvent) {
    let _ = sink.send(event);
}

/// Bidirectional message channel to one MCP server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection and begin delivering events to `sink`.
    async fn start(&self, sink: EventSink) -> Result<()>;

    /// Send one or more messages.
    async fn send(&self, messages: Vec<JsonRpcMessage>) -> Result<()>;

    /// Cancel background work and release server-side state.
    async fn close(&self) -> Result<()>;

    /// Session id issued by the server, if the transport has one.
    fn session_id(&self) -> Option<String> {
        None
    }
}

/// Builds the transport for a server configuration.
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &ServerConfig) -> Result<Arc<dyn Transport>>;
}

/// Factory used outside of tests: HTTP transports share one client,
/// stdio servers are spawned, in-memory transports must be registered.
pub struct DefaultTransportFactory {
    client: Client,
    reconnect: ReconnectConfig,
    auth_providers: Mutex<HashMap<String, Arc<dyn OAuthClientProvider>>>,
    in_memory: Mutex<HashMap<String, InMemoryTransport>>,
}

impl Default for DefaultTransportFactory {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}

impl DefaultTransportFactory {
    pub fn new(reconnect: ReconnectConfig) -> Self {
        let client = create_streaming_client().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to build HTTP client, using defaults");
            Client::new()
        });
        Self::with_client(client, reconnect)
    }

    pub fn with_client(client: Client, reconnect: ReconnectConfig) -> Self {
        Self {
            client,
            reconnect,
            auth_providers: Mutex::new(HashMap::new()),
            in_memory: Mutex::new(HashMap::new()),
        }
    }

    /// Use `provider` for the HTTP transports of `server_id`, taking
    /// precedence over a configured `bearerToken`.
    pub fn with_auth_provider(
        self,
        server_id: impl Into<String>,
        provider: Arc<dyn OAuthClientProvider>,
    ) -> Self {
        self.auth_providers.lock().insert(server_id.into(), provider);
        self
    }

    /// Register the client half of an in-memory pair for `server_id`. It is
    /// handed out once, on the next connect of that server.
    pub fn register_in_memory(&self, server_id: impl Into<String>, transport: InMemoryTransport) {
        self.in_memory.lock().insert(server_id.into(), transport);
    }

    fn auth_provider(&self, config: &ServerConfig) -> Option<Arc<dyn OAuthClientProvider>> {
        if let Some(provider) = self.auth_providers.lock().get(&config.id) {
            return Some(provider.clone());
        }
        config.bearer_token.as_ref().map(|token| {
            Arc::new(StaticTokenProvider::new(token.clone())) as Arc<dyn OAuthClientProvider>
        })
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, config: &ServerConfig) -> Result<Arc<dyn Transport>> {
        config.validate()?;
        match config.transport_kind {
            TransportKind::StreamableHttp => {
                let mut transport = StreamableHttpTransport::new(self.client.clone(), config.url()?)
                    .with_headers(config.headers.clone())
                    .with_reconnect(self.reconnect.clone());
                if let Some(provider) = self.auth_provider(config) {
                    transport = transport.with_auth_provider(provider);
                }
                Ok(Arc::new(transport))
            }
            TransportKind::Sse => {
                let mut transport = SseTransport::new(self.client.clone(), config.url()?)
                    .with_headers(config.headers.clone());
                if let Some(provider) = self.auth_provider(config) {
                    transport = transport.with_auth_provider(provider);
                }
                Ok(Arc::new(transport))
            }
            TransportKind::Stdio => Ok(Arc::new(StdioTransport::from_config(config)?)),
            TransportKind::InMemory => self
                .in_memory
                .lock()
                .remove(&config.id)
                .map(|t| Arc::new(t) as Arc<dyn Transport>)
                .ok_or_else(|| {
                    McpError::config(format!(
                        "no in-memory transport registered for server '{}'",
                        config.id
                    ))
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_rejects_missing_base_url() {
        let factory = DefaultTransportFactory::default();
        let mut config = ServerConfig::streamable_http("remote", "Remote", "http://localhost");
        config.base_url = None;
        let err = factory.create(&config).err().expect("missing baseUrl");
        assert!(err.is_config());
    }

    #[test]
    fn test_factory_hands_out_in_memory_once() {
        let factory = DefaultTransportFactory::default();
        let (client, _server) = InMemoryTransport::pair();
        factory.register_in_memory("mem", client);

        let config = ServerConfig::in_memory("mem", "Memory");
        assert!(factory.create(&config).is_ok());
        assert!(factory.create(&config).is_err());
    }
}
