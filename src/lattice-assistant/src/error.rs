use lattice_mcp_client::McpError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AssistantError>;

#[derive(Debug, Error)]
pub enum AssistantError {
    /// The model provider failed to produce a reply.
    #[error("model provider '{provider}' failed: {message}")]
    Model { provider: String, message: String },

    #[error(transparent)]
    Client(#[from] McpError),
}

impl AssistantError {
    pub fn model(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Model {
            provider: provider.into(),
            message: message.into(),
        }
    }
}
