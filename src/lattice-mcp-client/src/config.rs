//! Server and client configuration.
//!
//! Configuration files are TOML or JSON (picked by extension) and may use
//! `{env:VAR}` / `{env:VAR:default}` placeholders anywhere in string values.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{McpError, Result};

/// `{env:VAR}` or `{env:VAR:default}`.
static ENV_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{env:([^:}]+)(?::([^}]*))?\}").expect("env regex pattern is valid")
});

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// How the client reaches a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    /// Child process speaking newline-delimited JSON.
    Stdio,
    /// Legacy HTTP+SSE (separate POST endpoint announced on the stream).
    Sse,
    /// Streamable HTTP (single endpoint, POST + optional GET stream).
    StreamableHttp,
    /// Channel pair registered with the transport factory.
    InMemory,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamableHttp",
            Self::InMemory => "inMemory",
        };
        f.pad(name)
    }
}

/// Configuration of one MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Unique identifier; the registry keys everything by it.
    pub id: String,
    /// Display name, also accepted wherever a server is looked up.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub transport_kind: TransportKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Static access token sent as `Authorization: Bearer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    fn new(id: impl Into<String>, name: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            transport_kind: kind,
            base_url: None,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            headers: HashMap::new(),
            cwd: None,
            bearer_token: None,
            is_active: true,
        }
    }

    /// Server launched as a child process.
    pub fn stdio(
        id: impl Into<String>,
        name: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        let mut config = Self::new(id, name, TransportKind::Stdio);
        config.command = Some(command.into());
        config
    }

    /// Server reached over legacy HTTP+SSE.
    pub fn sse(
        id: impl Into<String>,
        name: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let mut config = Self::new(id, name, TransportKind::Sse);
        config.base_url = Some(base_url.into());
        config
    }

    /// Server reached over streamable HTTP.
    pub fn streamable_http(
        id: impl Into<String>,
        name: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let mut config = Self::new(id, name, TransportKind::StreamableHttp);
        config.base_url = Some(base_url.into());
        config
    }

    /// Server reached through a transport registered with the factory.
    pub fn in_memory(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, name, TransportKind::InMemory)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Name for log lines and error messages.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Parsed `baseUrl`. Required for the HTTP transports.
    pub fn url(&self) -> Result<Url> {
        let raw = self.base_url.as_deref().ok_or_else(|| {
            McpError::config(format!(
                "server '{}' uses {} transport but has no baseUrl",
                self.id, self.transport_kind
            ))
        })?;
        Url::parse(raw)
            .map_err(|e| McpError::config(format!("server '{}' has invalid baseUrl: {e}", self.id)))
    }

    /// Check that the fields required by the transport kind are present.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(McpError::config("server id must not be empty"));
        }
        match self.transport_kind {
            TransportKind::Sse | TransportKind::StreamableHttp => {
                self.url()?;
            }
            TransportKind::Stdio => {
                let command = self.command.as_deref().unwrap_or_default().trim();
                if command.is_empty() {
                    return Err(McpError::config(format!(
                        "server '{}' uses stdio transport but has no command",
                        self.id
                    )));
                }
            }
            TransportKind::InMemory => {}
        }
        Ok(())
    }
}

/// Reconnection policy for long-lived streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    /// Never reconnect.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Backoff before reconnect attempt `attempt` (0-based), doubling up to
    /// the configured maximum.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let millis = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct McpConfig {
    pub servers: Vec<ServerConfig>,
    pub request_timeout_secs: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl McpConfig {
    /// Load from a `.toml` or `.json` file, substituting `{env:...}`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env(&raw)?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let config: Self = match extension.as_deref() {
            Some("json") => serde_json::from_str(&substituted)?,
            Some("toml") => toml::from_str(&substituted)
                .map_err(|e| McpError::config(format!("{}: {e}", path.display())))?,
            _ => {
                return Err(McpError::config(format!(
                    "unsupported config format: {}",
                    path.display()
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Look a server up by id, then by name.
    pub fn server(&self, id_or_name: &str) -> Option<&ServerConfig> {
        self.servers
            .iter()
            .find(|s| s.id == id_or_name)
            .or_else(|| self.servers.iter().find(|s| s.name == id_or_name))
    }

    /// Validate every server and reject duplicate ids.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            server.validate()?;
            if !seen.insert(server.id.as_str()) {
                return Err(McpError::config(format!("duplicate server id '{}'", server.id)));
            }
        }
        Ok(())
    }
}

/// Replace `{env:VAR}` and `{env:VAR:default}` placeholders.
///
/// A variable that is unset and has no default is a configuration error.
pub fn substitute_env(input: &str) -> Result<String> {
    let mut missing = None;
    let output = ENV_REGEX.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(value) => value,
            Err(_) => match caps.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            },
        }
    });
    match missing {
        Some(name) => Err(McpError::config(format!(
            "environment variable '{name}' not set and no default provided"
        ))),
        None => Ok(output.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_server_config_wire_names() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"id":"files","name":"Files","transportKind":"streamableHttp","baseUrl":"http://localhost:3000/mcp"}"#,
        )
        .expect("parse");
        assert_eq!(config.transport_kind, TransportKind::StreamableHttp);
        assert!(config.is_active);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_transport_fields() {
        let mut http = ServerConfig::streamable_http("a", "A", "");
        http.base_url = None;
        assert!(http.validate().unwrap_err().is_config());

        let bad_url = ServerConfig::sse("b", "B", "not a url");
        assert!(bad_url.validate().is_err());

        let stdio = ServerConfig::stdio("c", "C", "  ");
        assert!(stdio.validate().is_err());

        assert!(ServerConfig::in_memory("d", "D").validate().is_ok());
    }

    #[test]
    fn test_reconnect_backoff_is_capped() {
        let config = ReconnectConfig::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(200), Duration::from_millis(500));
    }

    #[test]
    fn test_substitute_env_default() {
        let out = substitute_env("url = \"{env:LATTICE_TEST_SURELY_UNSET:http://fallback}\"")
            .expect("substitute");
        assert_eq!(out, "url = \"http://fallback\"");
        assert!(substitute_env("{env:LATTICE_TEST_SURELY_UNSET}").is_err());
    }

    #[test]
    fn test_load_toml() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("tempfile");
        write!(
            file,
            r#"
requestTimeoutSecs = 5

[[servers]]
id = "search"
name = "Search"
transportKind = "streamableHttp"
baseUrl = "{{env:LATTICE_TEST_SURELY_UNSET:http://localhost:9000}}/mcp"

[[servers]]
id = "fs"
name = "Filesystem"
transportKind = "stdio"
command = "mcp-fs"
args = ["--root", "/tmp"]
"#
        )
        .expect("write");

        let config = McpConfig::load(file.path()).expect("load");
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.servers.len(), 2);
        assert_eq!(
            config.server("Search").and_then(|s| s.base_url.as_deref()),
            Some("http://localhost:9000/mcp")
        );
        assert_eq!(config.server("fs").map(|s| s.args.len()), Some(2));
    }

    #[test]
    fn test_load_rejects_duplicate_ids() {
        let mut file = tempfile::Builder::new()
            .suffix(".json")
            .tempfile()
            .expect("tempfile");
        write!(
            file,
            r#"{{"servers":[
                {{"id":"x","name":"X","transportKind":"inMemory"}},
                {{"id":"x","name":"Y","transportKind":"inMemory"}}
            ]}}"#
        )
        .expect("write");
        assert!(McpConfig::load(file.path()).is_err());
    }
}
