//! OAuth seam for the HTTP transports.
//!
//! The transports never run an authorization flow themselves. They ask an
//! [`OAuthClientProvider`] for tokens, and on a `401` call [`auth`] once
//! before retrying the request.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{McpError, Result};

/// OAuth tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthTokens {
    /// Access token sent as `Authorization: Bearer`.
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix timestamp when the access token expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl OAuthTokens {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            scope: None,
        }
    }

    /// Whether the access token has expired. Tokens without an expiry never do.
    pub fn is_expired(&self) -> bool {
        let Some(expires_at) = self.expires_at else {
            return false;
        };
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        now >= expires_at
    }
}

/// Outcome of an authorization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// Fresh tokens are available from [`OAuthClientProvider::tokens`].
    Authorized,
    /// The user has to visit this URL; call
    /// [`OAuthClientProvider::finish_authorization`] with the resulting code.
    Redirect(Url),
}

/// Source of access tokens for one server.
#[async_trait]
pub trait OAuthClientProvider: Send + Sync {
    /// Current tokens, if any.
    async fn tokens(&self) -> Option<OAuthTokens>;

    /// Obtain new tokens for `server_url`, refreshing or starting a flow.
    async fn authorize(&self, server_url: &Url) -> Result<AuthResult>;

    /// Exchange an authorization code obtained after a redirect.
    async fn finish_authorization(&self, server_url: &Url, code: &str) -> Result<()>;
}

/// Run one authorization attempt. A required redirect is reported as
/// [`McpError::Unauthorized`] since the transport cannot complete it alone.
pub async fn auth(provider: &dyn OAuthClientProvider, server_url: &Url) -> Result<()> {
    match provider.authorize(server_url).await? {
        AuthResult::Authorized => {
            debug!(url = %server_url, "Authorization refreshed");
            Ok(())
        }
        AuthResult::Redirect(redirect) => Err(McpError::Unauthorized(format!(
            "user authorization required at {redirect}"
        ))),
    }
}

/// Provider for a fixed, pre-issued bearer token.
///
/// `authorize` succeeds only while a non-expired token is held, so a server
/// that keeps rejecting it fails after the single retry.
pub struct StaticTokenProvider {
    tokens: RwLock<Option<OAuthTokens>>,
}

impl StaticTokenProvider {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            tokens: RwLock::new(Some(OAuthTokens::bearer(access_token))),
        }
    }

    /// Replace the held token.
    pub fn set_token(&self, access_token: impl Into<String>) {
        *self.tokens.write() = Some(OAuthTokens::bearer(access_token));
    }
}

#[async_trait]
impl OAuthClientProvider for StaticTokenProvider {
    async fn tokens(&self) -> Option<OAuthTokens> {
        self.tokens.read().clone()
    }

    async fn authorize(&self, server_url: &Url) -> Result<AuthResult> {
        match self.tokens.read().as_ref() {
            Some(tokens) if !tokens.is_expired() => Ok(AuthResult::Authorized),
            _ => Err(McpError::Unauthorized(format!(
                "no valid token configured for {server_url}"
            ))),
        }
    }

    async fn finish_authorization(&self, _server_url: &Url, code: &str) -> Result<()> {
        self.set_token(code);
        Ok(())
    }
}
