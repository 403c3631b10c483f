//! Extraction of `<tool_use>` blocks from model output.

use std::sync::LazyLock;

use lattice_mcp_client::McpTool;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::warn;

static TOOL_USE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)<tool_use>\s*<name>\s*(.*?)\s*</name>\s*<arguments>\s*(.*?)\s*</arguments>\s*</tool_use>",
    )
    .expect("tool_use regex pattern is valid")
});

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool: McpTool,
    pub arguments: Map<String, Value>,
}

/// Every well-formed call in `text` targeting a tool in `tools`, in order.
///
/// Calls with arguments that are not a JSON object, or naming an unknown
/// tool, are logged and dropped.
pub fn parse_tool_calls(text: &str, tools: &[McpTool]) -> Vec<ToolCall> {
    TOOL_USE_REGEX
        .captures_iter(text)
        .filter_map(|caps| {
            let name = &caps[1];
            let raw_args = &caps[2];

            let arguments = match parse_arguments(raw_args) {
                Some(arguments) => arguments,
                None => {
                    warn!(
                        tool = %name,
                        arguments = %raw_args,
                        "Dropping tool call with invalid JSON arguments"
                    );
                    return None;
                }
            };

            match tools.iter().find(|tool| tool.id == name) {
                Some(tool) => Some(ToolCall {
                    tool: tool.clone(),
                    arguments,
                }),
                None => {
                    warn!(tool = %name, "Dropping call to unknown tool");
                    None
                }
            }
        })
        .collect()
}

fn parse_arguments(raw: &str) -> Option<Map<String, Value>> {
    if raw.is_empty() {
        return Some(Map::new());
    }
    match serde_json::from_str(raw).ok()? {
        Value::Object(map) => Some(map),
        Value::Null => Some(Map::new()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn tool(server: &str, name: &str) -> McpTool {
        McpTool {
            id: format!("{server}:{name}"),
            server_id: server.to_string(),
            server_name: server.to_string(),
            name: name.to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
        }
    }

    #[test]
    fn test_multiple_calls_in_order() {
        let tools = vec![tool("docs", "search"), tool("math", "add")];
        let text = r#"Let me check.
<tool_use>
<name>docs:search</name>
<arguments>{"query": "rust"}</arguments>
</tool_use>
and
<tool_use><name>math:add</name><arguments>
{"a": 1, "b": 2}
</arguments></tool_use>"#;

        let calls = parse_tool_calls(text, &tools);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].tool.id, "docs:search");
        assert_eq!(Value::Object(calls[0].arguments.clone()), json!({"query": "rust"}));
        assert_eq!(calls[1].tool.name, "add");
        assert_eq!(Value::Object(calls[1].arguments.clone()), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_invalid_and_unknown_calls_are_dropped() {
        let tools = vec![tool("docs", "search")];
        let text = r#"
<tool_use><name>docs:search</name><arguments>{not json}</arguments></tool_use>
<tool_use><name>docs:search</name><arguments>[1, 2]</arguments></tool_use>
<tool_use><name>web:fetch</name><arguments>{}</arguments></tool_use>
<tool_use><name>search</name><arguments>{}</arguments></tool_use>
<tool_use><name>docs:search</name><arguments></arguments></tool_use>"#;

        let calls = parse_tool_calls(text, &tools);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].arguments.is_empty());
    }

    #[test]
    fn test_plain_text_has_no_calls() {
        let tools = vec![tool("docs", "search")];
        assert!(parse_tool_calls("The answer is 42.", &tools).is_empty());
        assert!(parse_tool_calls("<tool_use><name>docs:search</name>", &tools).is_empty());
    }
}
