//! Stdio transport: a child process speaking newline-delimited JSON.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use lattice_mcp_types::JsonRpcMessage;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::sse_stream::dispatch_data;
use super::{EventSink, Transport, TransportEvent, emit};
use crate::config::ServerConfig;
use crate::error::{McpError, Result};

/// Substrings marking parent environment variables that are not passed on.
const SENSITIVE_PATTERNS: &[&str] =
    &["KEY", "SECRET", "TOKEN", "PASSWORD", "CREDENTIAL", "PRIVATE"];

/// Variables passed on even though they match a sensitive pattern.
const ALLOWED_ENV_VARS: &[&str] = &["PATH", "HOME", "USER", "SHELL"];

/// Whether a parent environment variable may be inherited by a server.
pub fn is_inheritable(key: &str) -> bool {
    if ALLOWED_ENV_VARS.contains(&key) {
        return true;
    }
    let upper = key.to_uppercase();
    !SENSITIVE_PATTERNS.iter().any(|pattern| upper.contains(pattern))
}

pub struct StdioTransport {
    server_id: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<String>,
    child: tokio::sync::Mutex<Option<Child>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    sink: RwLock<Option<EventSink>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StdioTransport {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        let command = command.into();
        Self {
            server_id: command.clone(),
            command,
            args,
            env: HashMap::new(),
            cwd: None,
            child: tokio::sync::Mutex::new(None),
            stdin: tokio::sync::Mutex::new(None),
            sink: RwLock::new(None),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let command = config
            .command
            .clone()
            .ok_or_else(|| McpError::config(format!("server '{}' has no command", config.id)))?;
        let mut transport = Self::new(command, config.args.clone());
        transport.server_id = config.id.clone();
        transport.env = config.env.clone();
        transport.cwd = config.cwd.clone();
        Ok(transport)
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.env_clear();
        for (key, value) in std::env::vars() {
            if is_inheritable(&key) {
                cmd.env(key, value);
            }
        }
        // Configured variables are trusted and win over inherited ones.
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self, sink: EventSink) -> Result<()> {
        let mut child_slot = self.child.lock().await;
        if child_slot.is_some() {
            return Err(McpError::transport("stdio transport already started"));
        }

        debug!(
            server_id = %self.server_id,
            command = %self.command,
            args = ?self.args,
            "Spawning MCP server"
        );
        let mut child = self.command().spawn().map_err(|e| {
            McpError::transport(format!("failed to spawn '{}': {e}", self.command))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::transport("child stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::transport("child stderr unavailable"))?;
        *self.stdin.lock().await = child.stdin.take();
        *child_slot = Some(child);
        *self.sink.write() = Some(sink.clone());

        let cancel = self.cancel.clone();
        let server_id = self.server_id.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => return,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        if !trimmed.starts_with('{') && !trimmed.starts_with('[') {
                            trace!(%server_id, line = %trimmed, "Skipping non-JSON stdout line");
                            continue;
                        }
                        dispatch_data(trimmed, &sink);
                    }
                    Ok(None) => {
                        info!(%server_id, "MCP server closed stdout");
                        break;
                    }
                    Err(e) => {
                        emit(&sink, TransportEvent::Error(e.into()));
                        break;
                    }
                }
            }
            emit(&sink, TransportEvent::Closed);
        });

        let server_id = self.server_id.clone();
        let stderr_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(%server_id, "stderr: {line}");
            }
        });

        self.tasks.lock().extend([reader, stderr_reader]);
        Ok(())
    }

    async fn send(&self, messages: Vec<JsonRpcMessage>) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin.as_mut().ok_or(McpError::Closed)?;
        for message in &messages {
            let mut line = serde_json::to_vec(message)?;
            line.push(b'\n');
            stdin.write_all(&line).await?;
        }
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.stdin.lock().await.take();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!(server_id = %self.server_id, error = %e, "Failed to kill MCP server");
            }
        }
        let sink = self.sink.write().take();
        if let Some(sink) = sink {
            emit(&sink, TransportEvent::Closed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_variables_are_filtered() {
        assert!(!is_inheritable("OPENAI_API_KEY"));
        assert!(!is_inheritable("github_token"));
        assert!(!is_inheritable("DB_PASSWORD"));
        assert!(is_inheritable("PATH"));
        assert!(is_inheritable("LANG"));
    }

    #[test]
    fn test_from_config_requires_command() {
        let mut config = ServerConfig::stdio("fs", "Files", "mcp-fs");
        config.command = None;
        assert!(StdioTransport::from_config(&config).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cat_echoes_messages() {
        let transport = StdioTransport::new("cat", Vec::new());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        transport.start(tx).await.expect("spawn cat");

        let ping = lattice_mcp_types::JsonRpcRequest::new(1, "ping");
        transport.send(vec![ping.clone().into()]).await.expect("send");

        match rx.recv().await {
            Some(TransportEvent::Message(message)) => {
                assert_eq!(message, JsonRpcMessage::from(ping))
            }
            other => panic!("unexpected event {other:?}"),
        }
        transport.close().await.expect("close");
    }
}
