//! Error types for the MCP client.

use std::time::Duration;

use lattice_mcp_types::{JsonRpcError, MessageValidationError};
use thiserror::Error;

/// Result type alias for MCP client operations.
pub type Result<T> = std::result::Result<T, McpError>;

/// Errors raised by transports, the JSON-RPC peer and the registry.
#[derive(Debug, Error)]
pub enum McpError {
    // Configuration errors: returned immediately, never retried
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Server not connected: {0}")]
    NotConnected(String),

    // Authentication
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // Transport
    #[error("HTTP {status} from {url}: {body}")]
    Http {
        status: u16,
        url: String,
        body: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport closed")]
    Closed,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Protocol
    #[error(transparent)]
    InvalidMessage(#[from] MessageValidationError),

    #[error("MCP error: {0}")]
    Rpc(#[from] JsonRpcError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Whether this error stems from bad configuration rather than I/O.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::UnknownServer(_))
    }

    /// Whether the server rejected our credentials.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    /// Copy of this error suitable for the transport event channel.
    ///
    /// Several variants wrap non-`Clone` sources, so the copy keeps the
    /// category where it can and falls back to the rendered message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Config(m) => Self::Config(m.clone()),
            Self::UnknownServer(m) => Self::UnknownServer(m.clone()),
            Self::NotConnected(m) => Self::NotConnected(m.clone()),
            Self::Unauthorized(m) => Self::Unauthorized(m.clone()),
            Self::Http { status, url, body } => Self::Http {
                status: *status,
                url: url.clone(),
                body: body.clone(),
            },
            Self::Closed => Self::Closed,
            Self::Timeout(d) => Self::Timeout(*d),
            Self::InvalidMessage(e) => Self::InvalidMessage(e.clone()),
            Self::Rpc(e) => Self::Rpc(e.clone()),
            Self::Protocol(m) => Self::Protocol(m.clone()),
            other => Self::Transport(other.to_string()),
        }
    }
}
