//! Sequential execution of tool-call pipelines.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use lattice_mcp_client::{
    ConnectionRegistry, ServerConfig, ServerHandle, ToolCallRequest, ToolCallResponse,
};
use lattice_mcp_types::CallToolResult;
use parking_lot::RwLock;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::condition;
use crate::error::{Result, WorkflowError};
use crate::template;

/// What to do when a step's tool call fails.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ErrorPolicy {
    /// Log the failure and run the next step.
    Continue,
    /// Stop the workflow and report the failure.
    #[default]
    Abort,
    /// Run another step in place of the failed one.
    Fallback(Box<WorkflowStep>),
}

impl ErrorPolicy {
    pub fn is_continue(&self) -> bool {
        matches!(self, Self::Continue)
    }
}

impl Serialize for ErrorPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Continue => serializer.serialize_str("continue"),
            Self::Abort => serializer.serialize_str("abort"),
            Self::Fallback(step) => step.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ErrorPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Keyword(String),
            Step(Box<WorkflowStep>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Keyword(keyword) => match keyword.as_str() {
                "continue" => Ok(Self::Continue),
                "abort" => Ok(Self::Abort),
                other => Err(D::Error::custom(format!(
                    "unknown error policy '{other}', expected 'continue', 'abort' or a step"
                ))),
            },
            Raw::Step(step) => Ok(Self::Fallback(step)),
        }
    }
}

/// One tool invocation in a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    /// Server id or name.
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Context key receiving the result text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_var: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub on_error: ErrorPolicy,
}

impl WorkflowStep {
    pub fn new(server: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
            args: Map::new(),
            output_var: None,
            condition: None,
            on_error: ErrorPolicy::Abort,
        }
    }

    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_output_var(mut self, name: impl Into<String>) -> Self {
        self.output_var = Some(name.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_on_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }
}

/// A named list of steps, as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    /// Load a `.json` or `.toml` workflow file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| WorkflowError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Ok(serde_json::from_str(&content)?),
            Some("toml") => Ok(toml::from_str(&content)?),
            other => Err(WorkflowError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionOptions {
    pub record_history: bool,
}

impl ExecutionOptions {
    pub fn with_history() -> Self {
        Self { record_history: true }
    }
}

/// One executed step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub step: WorkflowStep,
    pub result: ToolCallResponse,
    pub timestamp: DateTime<Utc>,
}

/// Terminal outcome of a workflow run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub success: bool,
    /// Context as it stood when the run ended.
    pub context: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistoryEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Mutable state of a single run.
struct Run {
    context: Map<String, Value>,
    history: Option<Vec<HistoryEntry>>,
}

impl Run {
    fn finish(self, error: Option<String>) -> WorkflowResult {
        WorkflowResult {
            success: error.is_none(),
            context: self.context,
            history: self.history,
            error,
        }
    }

    fn record(&mut self, step: &WorkflowStep, result: &ToolCallResponse) {
        if let Some(history) = self.history.as_mut() {
            history.push(HistoryEntry {
                step: step.clone(),
                result: result.clone(),
                timestamp: Utc::now(),
            });
        }
    }

    fn store_output(&mut self, step: &WorkflowStep, result: &ToolCallResponse) {
        if let Some(var) = &step.output_var {
            self.context.insert(var.clone(), Value::String(result.text()));
        }
    }
}

/// Runs workflows against servers registered with it.
///
/// Tool calls go through the shared [`ConnectionRegistry`], which connects
/// lazily on first use.
pub struct WorkflowOrchestrator {
    registry: Arc<ConnectionRegistry>,
    servers: RwLock<HashMap<String, ServerConfig>>,
}

impl WorkflowOrchestrator {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            servers: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Make a server addressable by steps. Re-registering an id replaces it.
    pub fn register_server(&self, config: ServerConfig) {
        debug!(server_id = %config.id, "Registering workflow server");
        self.servers.write().insert(config.id.clone(), config);
    }

    /// Look a registered server up by id, then by name.
    pub fn resolve_server(&self, id_or_name: &str) -> Option<ServerHandle> {
        self.resolve_config(id_or_name).map(|config| ServerHandle {
            name: config.display_name().to_string(),
            id: config.id,
        })
    }

    fn resolve_config(&self, id_or_name: &str) -> Option<ServerConfig> {
        let servers = self.servers.read();
        servers
            .get(id_or_name)
            .or_else(|| servers.values().find(|config| config.name == id_or_name))
            .cloned()
    }

    /// Execute `steps` in order, threading `context` through them.
    ///
    /// Step failures never surface as `Err`: they end up in the returned
    /// [`WorkflowResult`]. `Err` is reserved for server configurations the
    /// registry cannot use.
    pub async fn execute_workflow(
        &self,
        steps: &[WorkflowStep],
        context: Map<String, Value>,
        options: ExecutionOptions,
    ) -> Result<WorkflowResult> {
        let mut run = Run {
            context,
            history: options.record_history.then(Vec::new),
        };

        for (index, step) in steps.iter().enumerate() {
            if let Some(condition) = &step.condition {
                let expression = template::substitute_condition(condition, &run.context);
                match condition::evaluate(&expression) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(step = index, tool = %step.tool, "Condition false, skipping step");
                        continue;
                    }
                    Err(e) => {
                        warn!(
                            step = index,
                            condition = %condition,
                            error = %e,
                            "Condition evaluation failed"
                        );
                        return Ok(run.finish(Some(format!(
                            "Failed to evaluate condition '{condition}': {e}"
                        ))));
                    }
                }
            }

            let result = self.execute_step(step, &run.context).await?;
            run.record(step, &result);

            if !result.is_error {
                run.store_output(step, &result);
                continue;
            }

            match &step.on_error {
                ErrorPolicy::Continue => {
                    warn!(
                        step = index,
                        tool = %step.tool,
                        error = %failure_message(&result),
                        "Step failed, continuing"
                    );
                }
                ErrorPolicy::Abort => {
                    warn!(
                        step = index,
                        tool = %step.tool,
                        error = %failure_message(&result),
                        "Step failed, aborting workflow"
                    );
                    return Ok(run.finish(Some(failure_message(&result))));
                }
                ErrorPolicy::Fallback(fallback) => {
                    info!(
                        step = index,
                        tool = %step.tool,
                        fallback = %fallback.tool,
                        "Step failed, running fallback"
                    );
                    let fallback_result = self.execute_step(fallback, &run.context).await?;
                    run.record(fallback, &fallback_result);
                    if !fallback_result.is_error {
                        run.store_output(fallback, &fallback_result);
                    } else if fallback.on_error.is_continue() {
                        warn!(step = index, tool = %fallback.tool, "Fallback failed, continuing");
                    } else {
                        warn!(
                            step = index,
                            tool = %fallback.tool,
                            "Fallback failed, aborting workflow"
                        );
                        return Ok(run.finish(Some(failure_message(&fallback_result))));
                    }
                }
            }
        }

        info!(steps = steps.len(), "Workflow completed");
        Ok(run.finish(None))
    }

    async fn execute_step(
        &self,
        step: &WorkflowStep,
        context: &Map<String, Value>,
    ) -> Result<ToolCallResponse> {
        let Some(config) = self.resolve_config(&step.server) else {
            return Ok(CallToolResult::error(format!(
                "Server not found: {}",
                step.server
            )));
        };

        let args = template::substitute_args(&step.args, context);
        debug!(server_id = %config.id, tool = %step.tool, "Executing step");
        let request = ToolCallRequest::new(config, step.tool.clone()).with_args(args);
        match self.registry.call_tool(request).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_config() => Err(e.into()),
            Err(e) => Ok(CallToolResult::error(e.to_string())),
        }
    }
}

/// Error text of a failed result: its first content item.
fn failure_message(result: &ToolCallResponse) -> String {
    result.first_text().unwrap_or("Unknown error").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_error_policy_keywords() {
        let step: WorkflowStep =
            serde_json::from_value(json!({"server": "s", "tool": "t", "onError": "continue"}))
                .unwrap();
        assert_eq!(step.on_error, ErrorPolicy::Continue);

        let step: WorkflowStep =
            serde_json::from_value(json!({"server": "s", "tool": "t"})).unwrap();
        assert_eq!(step.on_error, ErrorPolicy::Abort);
        assert!(step.args.is_empty());

        let err = serde_json::from_value::<WorkflowStep>(
            json!({"server": "s", "tool": "t", "onError": "retry"}),
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_error_policy_fallback_step() {
        let step: WorkflowStep = serde_json::from_value(json!({
            "server": "primary",
            "tool": "search",
            "outputVar": "hits",
            "onError": {"server": "backup", "tool": "search", "outputVar": "hits"}
        }))
        .unwrap();
        let expected = WorkflowStep::new("backup", "search").with_output_var("hits");
        assert_eq!(step.on_error, ErrorPolicy::Fallback(Box::new(expected)));

        let round_trip = serde_json::to_value(&step).unwrap();
        assert_eq!(round_trip["onError"]["server"], "backup");
        assert_eq!(round_trip["onError"]["onError"], "abort");
    }
}
