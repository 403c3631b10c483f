use std::path::PathBuf;

use lattice_mcp_client::McpError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkflowError>;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("failed to read workflow {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON workflow: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid TOML workflow: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("unsupported workflow format '{0}' (expected .json or .toml)")]
    UnsupportedFormat(String),

    /// A server configuration the registry refused to use.
    #[error(transparent)]
    Client(#[from] McpError),
}
