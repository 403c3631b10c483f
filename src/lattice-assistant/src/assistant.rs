//! The tool-use conversation loop.

use std::sync::Arc;

use futures::future::join_all;
use lattice_mcp_client::{ConnectionRegistry, McpTool, ToolCallRequest};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::parser::{ToolCall, parse_tool_calls};
use crate::prompt::build_system_prompt;
use crate::provider::{Message, ModelProvider};

/// Deepest tool round; the model is called at most `MAX_DEPTH + 1` times
/// per [`McpAssistant::run`].
pub const MAX_DEPTH: usize = 10;

/// Returned when the model is still calling tools after the last round.
pub const CONTINUE_MESSAGE: &str = "I've reached the maximum number of tool-use steps for this request. \
     Please ask me to continue if you'd like me to keep going.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallStatus {
    Pending,
    Invoking,
    Done,
    Error,
}

/// A status transition of one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallProgress {
    /// Unique within a single `run`.
    pub call_id: String,
    pub tool_id: String,
    pub status: ToolCallStatus,
    /// Result text once the call is `Done` or `Error`.
    pub result: Option<String>,
}

pub type ProgressCallback = Arc<dyn Fn(ToolCallProgress) + Send + Sync>;

/// A tool call made while answering.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool_id: String,
    pub arguments: Map<String, Value>,
    pub result: String,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssistantResponse {
    /// Final answer, or [`CONTINUE_MESSAGE`] when the step cap was hit.
    pub text: String,
    pub tool_calls: Vec<ToolCallRecord>,
    /// Number of model invocations.
    pub iterations: usize,
    pub hit_limit: bool,
}

/// Drives a [`ModelProvider`] through the XML tool-use protocol, executing
/// requested calls on the shared registry.
pub struct McpAssistant {
    registry: Arc<ConnectionRegistry>,
    provider: Arc<dyn ModelProvider>,
    custom_prompt: Option<String>,
    tools: Vec<McpTool>,
    history: Vec<Message>,
    progress: Option<ProgressCallback>,
}

impl McpAssistant {
    pub fn new(registry: Arc<ConnectionRegistry>, provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            registry,
            provider,
            custom_prompt: None,
            tools: Vec::new(),
            history: Vec::new(),
            progress: None,
        }
    }

    /// Extra instructions appended to the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.custom_prompt = Some(prompt.into());
        self
    }

    pub fn with_progress(
        mut self,
        callback: impl Fn(ToolCallProgress) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    /// Reload the tool catalog from every connected server.
    pub async fn refresh_tools(&mut self) -> usize {
        self.tools = self.registry.get_all_tools().await;
        debug!(tools = self.tools.len(), "Assistant tool catalog refreshed");
        self.tools.len()
    }

    pub fn tools(&self) -> &[McpTool] {
        &self.tools
    }

    /// Conversation so far, without the system prompt.
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    pub fn system_prompt(&self) -> String {
        build_system_prompt(&self.tools, self.custom_prompt.as_deref())
    }

    /// Answer `input`, calling tools as the model requests.
    ///
    /// Tool failures are fed back to the model and never end the
    /// conversation; only a failing model call returns `Err`.
    pub async fn run(&mut self, input: &str) -> Result<AssistantResponse> {
        self.history.push(Message::user(input));
        let system = Message::system(self.system_prompt());
        let mut records = Vec::new();

        for depth in 0..=MAX_DEPTH {
            let mut messages = Vec::with_capacity(self.history.len() + 1);
            messages.push(system.clone());
            messages.extend(self.history.iter().cloned());

            let reply = self.provider.complete(&messages).await?;
            self.history.push(Message::assistant(reply.clone()));

            let calls = parse_tool_calls(&reply, &self.tools);
            if calls.is_empty() {
                info!(iterations = depth + 1, tool_calls = records.len(), "Assistant answered");
                return Ok(AssistantResponse {
                    text: reply,
                    tool_calls: records,
                    iterations: depth + 1,
                    hit_limit: false,
                });
            }

            debug!(depth, calls = calls.len(), "Executing tool calls");
            let offset = records.len();
            let executed = self.execute_calls(calls, offset).await;
            for record in &executed {
                self.history.push(Message::user(result_block(&record.tool_id, &record.result)));
            }
            records.extend(executed);
        }

        warn!(max_depth = MAX_DEPTH, "Assistant hit the tool-use step limit");
        Ok(AssistantResponse {
            text: CONTINUE_MESSAGE.to_string(),
            tool_calls: records,
            iterations: MAX_DEPTH + 1,
            hit_limit: true,
        })
    }

    /// Run `calls` concurrently; results come back in call order.
    async fn execute_calls(&self, calls: Vec<ToolCall>, offset: usize) -> Vec<ToolCallRecord> {
        let calls: Vec<(String, ToolCall)> = calls
            .into_iter()
            .enumerate()
            .map(|(index, call)| (format!("call-{}", offset + index + 1), call))
            .collect();

        for (call_id, call) in &calls {
            self.report(call_id, &call.tool.id, ToolCallStatus::Pending, None);
        }

        join_all(calls.into_iter().map(|(call_id, call)| self.execute_call(call_id, call))).await
    }

    async fn execute_call(&self, call_id: String, call: ToolCall) -> ToolCallRecord {
        let ToolCall { tool, arguments } = call;
        self.report(&call_id, &tool.id, ToolCallStatus::Invoking, None);

        let request = ToolCallRequest::new(tool.server_id.as_str(), tool.name.clone())
            .with_args(arguments.clone());
        let (result, is_error) = match self.registry.call_tool(request).await {
            Ok(response) if response.is_error => (format!("Error: {}", response.text()), true),
            Ok(response) => (response.text(), false),
            Err(e) => (format!("Error: {e}"), true),
        };

        if is_error {
            warn!(tool = %tool.id, error = %result, "Tool call failed");
        }
        let status = if is_error {
            ToolCallStatus::Error
        } else {
            ToolCallStatus::Done
        };
        self.report(&call_id, &tool.id, status, Some(result.clone()));

        ToolCallRecord {
            call_id,
            tool_id: tool.id,
            arguments,
            result,
            is_error,
        }
    }

    fn report(&self, call_id: &str, tool_id: &str, status: ToolCallStatus, result: Option<String>) {
        if let Some(progress) = &self.progress {
            progress(ToolCallProgress {
                call_id: call_id.to_string(),
                tool_id: tool_id.to_string(),
                status,
                result,
            });
        }
    }
}

/// The user turn carrying a tool result back to the model.
pub fn result_block(tool_id: &str, result: &str) -> String {
    format!("<tool_use_result>\n<name>{tool_id}</name>\n<result>{result}</result>\n</tool_use_result>")
}
