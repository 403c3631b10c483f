//! Conversation messages and the model seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A plain-text conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// A text-in, text-out language model.
///
/// Tool use is negotiated entirely through the message text, so providers
/// need no function-calling support.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name, used in logs and errors.
    fn name(&self) -> &str;

    /// Produce the next assistant turn for `messages`. The first message is
    /// the system prompt.
    async fn complete(&self, messages: &[Message]) -> Result<String>;
}
