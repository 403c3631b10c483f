//! Lattice MCP Types - wire types for the Model Context Protocol.
//!
//! Everything a client needs to talk to an MCP server:
//! - JSON-RPC 2.0 envelopes and the validated [`JsonRpcMessage`] union
//! - the `initialize` handshake and capability negotiation
//! - tools, prompts and resources (list/call/get/read shapes)
//! - content items carried by tool results and prompt messages
//!
//! # Example
//! ```rust
//! use lattice_mcp_types::{CallToolResult, Content};
//!
//! let result = CallToolResult::success(vec![Content::text("hello")]);
//! assert_eq!(result.text(), "hello");
//! ```

mod catalog;
mod content;
mod handshake;
mod jsonrpc;
mod tools;

/// MCP method name constants.
pub mod methods;

/// Protocol version sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Versions this client accepts from a server's `initialize` result.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-03-26", "2024-11-05", "2024-10-07"];

pub use catalog::{
    GetPromptParams, GetPromptResult, ListPromptsResult, ListResourcesResult, Prompt,
    PromptArgument, PromptMessage, ReadResourceParams, ReadResourceResult, Resource,
    ResourceContent, Role,
};
pub use content::Content;
pub use handshake::{
    ClientCapabilities, Implementation, InitializeParams, InitializeResult, ListChanged,
    ServerCapabilities,
};
pub use jsonrpc::{
    ErrorCode, JSONRPC_VERSION, JsonRpcError, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, MessageValidationError, RequestId,
};
pub use tools::{CallToolParams, CallToolResult, ListToolsResult, Tool};
