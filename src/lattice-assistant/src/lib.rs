//! Model-driven MCP tool use.
//!
//! [`McpAssistant`] asks a [`ModelProvider`] for replies, parses the
//! `<tool_use>` blocks out of them, runs the requested tools concurrently
//! through a shared `ConnectionRegistry` and feeds the results back until
//! the model answers in plain text.

pub mod assistant;
pub mod chat_completions;
pub mod error;
pub mod parser;
pub mod prompt;
pub mod provider;

pub use assistant::{
    AssistantResponse, CONTINUE_MESSAGE, MAX_DEPTH, McpAssistant, ProgressCallback,
    ToolCallProgress, ToolCallRecord, ToolCallStatus,
};
pub use chat_completions::ChatCompletionsProvider;
pub use error::{AssistantError, Result};
pub use parser::{ToolCall, parse_tool_calls};
pub use provider::{Message, ModelProvider, Role};
