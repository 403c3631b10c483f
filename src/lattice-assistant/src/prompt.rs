//! System prompt construction.

use lattice_mcp_client::McpTool;

/// Used when there are neither tools nor custom instructions.
pub const GENERIC_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer the user's questions clearly and concisely.";

const TOOL_USE_INSTRUCTIONS: &str = r#"You are an assistant with access to a set of tools. You can call them to gather information or take actions, and you will receive their results before writing your answer.

## Tool use format

Call a tool by writing an XML block with the tool id and its arguments as a JSON object:

<tool_use>
<name>{tool id}</name>
<arguments>{JSON arguments}</arguments>
</tool_use>

You may call several tools in one message; they run concurrently. Each result comes back in a message of this form:

<tool_use_result>
<name>{tool id}</name>
<result>{result text}</result>
</tool_use_result>

## Examples

User: What is the weather in Lisbon?
Assistant: <tool_use>
<name>weather:get_forecast</name>
<arguments>{"city": "Lisbon"}</arguments>
</tool_use>

User: Find documents about invoices and list open tickets.
Assistant: <tool_use>
<name>docs:search</name>
<arguments>{"query": "invoices"}</arguments>
</tool_use>
<tool_use>
<name>tracker:list_tickets</name>
<arguments>{"status": "open"}</arguments>
</tool_use>"#;

const TOOL_USE_RULES: &str = r#"## Rules

1. Only call tools listed in <tools>, using their exact id.
2. Arguments must be a valid JSON object matching the tool's input schema.
3. Wait for tool results before relying on them; never invent results.
4. If a tool fails, read the error and either retry with corrected arguments or explain the failure.
5. When you have enough information, answer directly without any <tool_use> block."#;

/// Build the system prompt for `tools` followed by optional custom
/// instructions.
pub fn build_system_prompt(tools: &[McpTool], custom: Option<&str>) -> String {
    let custom = custom.map(str::trim).filter(|c| !c.is_empty());
    if tools.is_empty() && custom.is_none() {
        return GENERIC_SYSTEM_PROMPT.to_string();
    }

    let mut prompt = String::with_capacity(4096);
    prompt.push_str(TOOL_USE_INSTRUCTIONS);
    prompt.push_str("\n\n## Available tools\n\n");
    prompt.push_str(&tools_xml(tools));
    prompt.push_str("\n\n");
    prompt.push_str(TOOL_USE_RULES);
    if let Some(custom) = custom {
        prompt.push_str("\n\n");
        prompt.push_str(custom);
    }
    prompt
}

/// The tool catalog as XML.
pub fn tools_xml(tools: &[McpTool]) -> String {
    let mut xml = String::from("<tools>\n");
    for tool in tools {
        xml.push_str("<tool>\n");
        xml.push_str(&format!("<name>{}</name>\n", tool.id));
        xml.push_str(&format!("<server>{}</server>\n", escape(&tool.server_name)));
        if let Some(description) = &tool.description {
            xml.push_str(&format!("<description>{}</description>\n", escape(description)));
        }
        xml.push_str(&format!("<arguments>{}</arguments>\n", tool.input_schema));
        xml.push_str("</tool>\n");
    }
    xml.push_str("</tools>");
    xml
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
