//! Subcommand handlers.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use lattice_assistant::{ChatCompletionsProvider, McpAssistant, ToolCallStatus};
use lattice_mcp_client::{ConnectionRegistry, McpConfig, ServerConfig, ToolCallRequest};
use lattice_workflow::{ExecutionOptions, WorkflowDefinition, WorkflowOrchestrator};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::cli::{
    AskArgs, CallArgs, CatalogArgs, Cli, Commands, RunArgs, ServersArgs, ToolsArgs,
};

pub async fn dispatch(cli: Cli) -> Result<()> {
    let config = McpConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    match cli.command {
        Commands::Servers(args) => list_servers(&config, args),
        Commands::Tools(args) => list_tools(&config, args).await,
        Commands::Call(args) => call_tool(&config, args).await,
        Commands::Run(args) => run_workflow(&config, args).await,
        Commands::Prompts(args) => list_prompts(&config, args).await,
        Commands::Resources(args) => list_resources(&config, args).await,
        Commands::Ask(args) => ask(&config, args).await,
    }
}

/// Parse a JSON object argument.
pub fn parse_json_object(raw: &str, what: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(raw).with_context(|| format!("{what} is not valid JSON"))? {
        Value::Object(map) => Ok(map),
        other => bail!("{what} must be a JSON object, got: {other}"),
    }
}

/// The active servers to work with: one selected by id or name, or all.
fn select_servers<'a>(
    config: &'a McpConfig,
    server: Option<&str>,
) -> Result<Vec<&'a ServerConfig>> {
    match server {
        Some(wanted) => {
            let found = config
                .server(wanted)
                .with_context(|| format!("No server named '{wanted}' in the configuration"))?;
            Ok(vec![found])
        }
        None => Ok(config.servers.iter().filter(|s| s.is_active).collect()),
    }
}

/// Connect to `servers`, warning about the ones that fail.
async fn connect_all(registry: &ConnectionRegistry, servers: &[&ServerConfig]) -> usize {
    let mut connected = 0;
    for server in servers {
        if registry.connect(server).await {
            connected += 1;
        } else {
            warn!(server_id = %server.id, "Skipping server that failed to connect");
        }
    }
    connected
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn list_servers(config: &McpConfig, args: ServersArgs) -> Result<()> {
    if args.json {
        return print_json(&config.servers);
    }
    if config.servers.is_empty() {
        println!("No servers configured.");
        return Ok(());
    }
    for server in &config.servers {
        let target = server
            .base_url
            .as_deref()
            .or(server.command.as_deref())
            .unwrap_or("-");
        let state = if server.is_active { "" } else { " (inactive)" };
        println!(
            "{:<20} {:<16} {}{}",
            server.id, server.transport_kind, target, state
        );
    }
    Ok(())
}

async fn list_tools(config: &McpConfig, args: ToolsArgs) -> Result<()> {
    let registry = ConnectionRegistry::from_config(config);
    let servers = select_servers(config, args.server.as_deref())?;
    connect_all(&registry, &servers).await;

    let tools = registry.get_all_tools().await;
    if args.json {
        print_json(&tools)?;
    } else if tools.is_empty() {
        println!("No tools available.");
    } else {
        for tool in &tools {
            let description = tool.description.as_deref().unwrap_or("");
            println!("{:<40} {}", tool.id, first_line(description));
        }
    }

    registry.disconnect_all().await;
    Ok(())
}

async fn call_tool(config: &McpConfig, args: CallArgs) -> Result<()> {
    let arguments = parse_json_object(&args.args, "--args")?;
    let server = config
        .server(&args.server)
        .with_context(|| format!("No server named '{}' in the configuration", args.server))?
        .clone();

    let registry = ConnectionRegistry::from_config(config);
    let request = ToolCallRequest::new(server, args.tool.clone()).with_args(arguments);
    let result = registry
        .call_tool(request)
        .await
        .with_context(|| format!("Failed to call tool '{}'", args.tool))?;
    registry.disconnect_all().await;

    if args.json {
        print_json(&result)?;
    } else {
        println!("{}", result.text());
    }
    if result.is_error {
        bail!("Tool '{}' reported an error", args.tool);
    }
    Ok(())
}

async fn run_workflow(config: &McpConfig, args: RunArgs) -> Result<()> {
    let definition = load_workflow(&args.workflow)?;
    let context = parse_json_object(&args.context, "--context")?;

    let registry = Arc::new(ConnectionRegistry::from_config(config));
    let orchestrator = WorkflowOrchestrator::new(registry.clone());
    for server in config.servers.iter().filter(|s| s.is_active) {
        orchestrator.register_server(server.clone());
    }

    info!(
        workflow = definition.name.as_deref().unwrap_or("unnamed"),
        steps = definition.steps.len(),
        "Running workflow"
    );
    let options = ExecutionOptions {
        record_history: args.history,
    };
    let result = orchestrator
        .execute_workflow(&definition.steps, context, options)
        .await
        .context("Workflow could not be started")?;
    registry.disconnect_all().await;

    if args.json {
        print_json(&result)?;
    } else {
        if let Some(history) = &result.history {
            for (index, entry) in history.iter().enumerate() {
                let status = if entry.result.is_error { "error" } else { "ok" };
                println!(
                    "[{}] {} {}:{} {}",
                    entry.timestamp.format("%H:%M:%S%.3f"),
                    index + 1,
                    entry.step.server,
                    entry.step.tool,
                    status
                );
            }
        }
        print_json(&result.context)?;
    }

    match result.error {
        Some(error) => bail!("Workflow failed: {error}"),
        None => Ok(()),
    }
}

fn load_workflow(path: &Path) -> Result<WorkflowDefinition> {
    WorkflowDefinition::load(path)
        .with_context(|| format!("Failed to load workflow from {}", path.display()))
}

async fn list_prompts(config: &McpConfig, args: CatalogArgs) -> Result<()> {
    let registry = ConnectionRegistry::from_config(config);
    let servers = select_servers(config, args.server.as_deref())?;
    connect_all(&registry, &servers).await;

    let prompts = registry.get_all_prompts().await;
    if prompts.is_empty() {
        println!("No prompts available.");
    }
    for (server_id, prompt) in &prompts {
        let description = prompt.description.as_deref().unwrap_or("");
        println!("{server_id}:{:<30} {}", prompt.name, first_line(description));
    }

    registry.disconnect_all().await;
    Ok(())
}

async fn list_resources(config: &McpConfig, args: CatalogArgs) -> Result<()> {
    let registry = ConnectionRegistry::from_config(config);
    let servers = select_servers(config, args.server.as_deref())?;
    connect_all(&registry, &servers).await;

    let resources = registry.get_all_resources().await;
    if resources.is_empty() {
        println!("No resources available.");
    }
    for (server_id, resource) in &resources {
        println!("{server_id:<20} {:<50} {}", resource.uri, resource.name);
    }

    registry.disconnect_all().await;
    Ok(())
}

async fn ask(config: &McpConfig, args: AskArgs) -> Result<()> {
    let registry = Arc::new(ConnectionRegistry::from_config(config));
    let servers = select_servers(config, None)?;
    let connected = connect_all(&registry, &servers).await;
    info!(connected, "Connected servers for assistant");

    let mut provider = ChatCompletionsProvider::new(&args.api_base, &args.model)
        .context("Failed to create model client")?;
    if let Some(key) = &args.api_key {
        provider = provider.with_api_key(key);
    }

    let mut assistant = McpAssistant::new(registry.clone(), Arc::new(provider)).with_progress(
        |progress| match progress.status {
            ToolCallStatus::Invoking => eprintln!("-> {} ({})", progress.tool_id, progress.call_id),
            ToolCallStatus::Error => eprintln!("!! {} failed", progress.tool_id),
            ToolCallStatus::Pending | ToolCallStatus::Done => {}
        },
    );
    if let Some(system) = args.system {
        assistant = assistant.with_system_prompt(system);
    }
    assistant.refresh_tools().await;

    let response = assistant.run(&args.prompt.join(" ")).await;
    registry.disconnect_all().await;
    let response = response.context("Assistant failed")?;

    println!("{}", response.text);
    if response.hit_limit {
        warn!(iterations = response.iterations, "Assistant stopped at the tool-use limit");
    }
    Ok(())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_json_object() {
        let map = parse_json_object(r#"{"q": "rust", "n": 3}"#, "--args").expect("object");
        assert_eq!(map.get("q"), Some(&Value::from("rust")));
        assert_eq!(map.len(), 2);

        let err = parse_json_object("[1]", "--args").unwrap_err();
        assert!(err.to_string().contains("must be a JSON object"));
        assert!(parse_json_object("{oops", "--context").is_err());
    }

    #[test]
    fn test_select_servers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("lattice.toml");
        std::fs::write(
            &path,
            r#"
[[servers]]
id = "docs"
name = "Docs"
transportKind = "streamableHttp"
baseUrl = "http://localhost:9000/mcp"

[[servers]]
id = "old"
name = "Old"
transportKind = "stdio"
command = "old-server"
isActive = false
"#,
        )
        .expect("write config");
        let config = McpConfig::load(&path).expect("load");

        let all: Vec<&str> = select_servers(&config, None)
            .expect("all")
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(all, vec!["docs"]);

        let by_name = select_servers(&config, Some("Old")).expect("by name");
        assert_eq!(by_name[0].id, "old");
        assert!(select_servers(&config, Some("missing")).is_err());
    }

    #[test]
    fn test_first_line() {
        assert_eq!(first_line("Search docs.\nMore detail."), "Search docs.");
        assert_eq!(first_line(""), "");
    }
}
