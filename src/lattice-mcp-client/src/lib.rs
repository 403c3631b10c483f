//! MCP client for Lattice.
//!
//! Layers, leaves first:
//! - [`transport`]: message channels to a server (streamable HTTP, legacy
//!   SSE, stdio, in-memory), with session tracking and OAuth retry
//! - [`peer`]: JSON-RPC request/response correlation over one transport
//! - [`registry`]: named server connections with cached tool, prompt and
//!   resource catalogs

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod peer;
pub mod registry;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use auth::{AuthResult, OAuthClientProvider, OAuthTokens, StaticTokenProvider};
pub use config::{McpConfig, ReconnectConfig, ServerConfig, TransportKind};
pub use error::{McpError, Result};
pub use peer::ServerConnection;
pub use registry::{
    ConnectionRegistry, LifecycleEvent, McpTool, ServerHandle, ServerRef, ToolCallRequest,
    ToolCallResponse,
};
pub use transport::{
    DefaultTransportFactory, EventSink, Transport, TransportEvent, TransportFactory,
};
