//! Workflow execution against in-process mock servers.

use std::sync::Arc;

use lattice_mcp_client::testing::{CallLog, MockServer, MockTransportFactory};
use lattice_mcp_client::{ConnectionRegistry, ServerConfig};
use lattice_mcp_types::{CallToolResult, Tool};
use lattice_workflow::{
    ErrorPolicy, ExecutionOptions, WorkflowDefinition, WorkflowOrchestrator, WorkflowStep,
};
use pretty_assertions::assert_eq;
use serde_json::{Map, Value, json};

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

/// A server with an `echo` tool returning its `text` argument and a `fail`
/// tool that always reports an error.
fn text_server(name: &str) -> MockServer {
    MockServer::new(name)
        .with_text_tool(Tool::new("echo", "Echo the text argument"), |args| {
            args.get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        })
        .with_tool(Tool::new("fail", "Always fails"), |_| {
            CallToolResult::error("disk full")
        })
}

struct Harness {
    orchestrator: WorkflowOrchestrator,
    primary: CallLog,
    backup: CallLog,
}

fn harness() -> Harness {
    let primary = text_server("primary");
    let backup = text_server("backup");
    let (primary_log, backup_log) = (primary.call_log(), backup.call_log());

    let factory = MockTransportFactory::new()
        .with_server("primary", move || primary.clone())
        .with_server("backup", move || backup.clone());
    let registry = Arc::new(ConnectionRegistry::with_factory(Arc::new(factory)));

    let orchestrator = WorkflowOrchestrator::new(registry);
    orchestrator.register_server(ServerConfig::in_memory("primary", "Primary Search"));
    orchestrator.register_server(ServerConfig::in_memory("backup", "Backup Search"));

    Harness {
        orchestrator,
        primary: primary_log,
        backup: backup_log,
    }
}

fn echo(server: &str, text: &str) -> WorkflowStep {
    WorkflowStep::new(server, "echo").with_args(object(json!({"text": text})))
}

#[tokio::test]
async fn test_output_var_round_trips_into_later_steps() {
    let h = harness();
    let steps = vec![
        echo("primary", "hello").with_output_var("greeting"),
        echo("primary", "{{greeting}}, world").with_output_var("sentence"),
    ];

    let result = h
        .orchestrator
        .execute_workflow(&steps, Map::new(), ExecutionOptions::default())
        .await
        .expect("workflow runs");

    assert!(result.success);
    assert_eq!(result.error, None);
    assert_eq!(result.context["greeting"], "hello");
    assert_eq!(result.context["sentence"], "hello, world");
    assert!(result.history.is_none());
    assert_eq!(
        h.primary.calls()[1].arguments,
        object(json!({"text": "hello, world"}))
    );
}

#[tokio::test]
async fn test_servers_resolve_by_name_and_initial_context_is_visible() {
    let h = harness();
    let steps = vec![echo("Backup Search", "{{user.name}}-suffix").with_output_var("out")];

    let result = h
        .orchestrator
        .execute_workflow(
            &steps,
            object(json!({"user": {"name": "X"}})),
            ExecutionOptions::default(),
        )
        .await
        .expect("workflow runs");

    assert!(result.success);
    assert_eq!(result.context["out"], "X-suffix");
    assert_eq!(h.backup.count(), 1);
    assert_eq!(h.primary.count(), 0);
}

#[tokio::test]
async fn test_continue_policy_runs_every_step_and_records_history() {
    let h = harness();
    let steps = vec![
        echo("primary", "one").with_output_var("first"),
        WorkflowStep::new("primary", "fail")
            .with_output_var("broken")
            .with_on_error(ErrorPolicy::Continue),
        echo("primary", "three").with_output_var("third"),
    ];

    let result = h
        .orchestrator
        .execute_workflow(&steps, Map::new(), ExecutionOptions::with_history())
        .await
        .expect("workflow runs");

    assert!(result.success);
    assert_eq!(h.primary.names(), vec!["echo", "fail", "echo"]);
    assert!(!result.context.contains_key("broken"));
    assert_eq!(result.context["third"], "three");

    let history = result.history.expect("history recorded");
    let tools: Vec<&str> = history.iter().map(|e| e.step.tool.as_str()).collect();
    assert_eq!(tools, vec!["echo", "fail", "echo"]);
    assert!(history[1].result.is_error);
    assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn test_abort_policy_stops_and_reports_first_text() {
    let h = harness();
    let steps = vec![
        echo("primary", "kept").with_output_var("kept"),
        WorkflowStep::new("primary", "fail"),
        echo("primary", "never").with_output_var("never"),
    ];

    let result = h
        .orchestrator
        .execute_workflow(&steps, Map::new(), ExecutionOptions::with_history())
        .await
        .expect("workflow runs");

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("disk full"));
    assert_eq!(result.context["kept"], "kept");
    assert!(!result.context.contains_key("never"));
    assert_eq!(h.primary.names(), vec!["echo", "fail"]);
    assert_eq!(result.history.map(|h| h.len()), Some(2));
}

#[tokio::test]
async fn test_fallback_step_replaces_failed_step() {
    let h = harness();
    let fallback = echo("backup", "from backup").with_output_var("answer");
    let steps = vec![
        WorkflowStep::new("primary", "fail")
            .with_output_var("answer")
            .with_on_error(ErrorPolicy::Fallback(Box::new(fallback))),
        echo("primary", "{{answer}}!").with_output_var("final"),
    ];

    let result = h
        .orchestrator
        .execute_workflow(&steps, Map::new(), ExecutionOptions::with_history())
        .await
        .expect("workflow runs");

    assert!(result.success);
    assert_eq!(result.context["final"], "from backup!");
    assert_eq!(h.backup.names(), vec!["echo"]);

    let history = result.history.expect("history recorded");
    let servers: Vec<&str> = history.iter().map(|e| e.step.server.as_str()).collect();
    assert_eq!(servers, vec!["primary", "backup", "primary"]);
}

#[tokio::test]
async fn test_failed_fallback_aborts_unless_it_continues() {
    let h = harness();
    let steps = vec![
        WorkflowStep::new("primary", "fail").with_on_error(ErrorPolicy::Fallback(Box::new(
            WorkflowStep::new("backup", "fail"),
        ))),
        echo("primary", "unreached"),
    ];
    let result = h
        .orchestrator
        .execute_workflow(&steps, Map::new(), ExecutionOptions::default())
        .await
        .expect("workflow runs");
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("disk full"));
    assert_eq!(h.primary.names(), vec!["fail"]);

    let h = harness();
    let steps = vec![
        WorkflowStep::new("primary", "fail").with_on_error(ErrorPolicy::Fallback(Box::new(
            WorkflowStep::new("backup", "fail").with_on_error(ErrorPolicy::Continue),
        ))),
        echo("primary", "reached").with_output_var("out"),
    ];
    let result = h
        .orchestrator
        .execute_workflow(&steps, Map::new(), ExecutionOptions::default())
        .await
        .expect("workflow runs");
    assert!(result.success);
    assert_eq!(result.context["out"], "reached");
}

#[tokio::test]
async fn test_false_condition_skips_step_without_history() {
    let h = harness();
    let steps = vec![
        echo("primary", "ok").with_output_var("status"),
        echo("primary", "skipped")
            .with_output_var("skipped")
            .with_condition("'{{status}}' === 'failed'"),
        echo("primary", "ran")
            .with_output_var("ran")
            .with_condition("'{{status}}' === 'ok' && {{missing}} == null"),
    ];

    let result = h
        .orchestrator
        .execute_workflow(&steps, Map::new(), ExecutionOptions::with_history())
        .await
        .expect("workflow runs");

    assert!(result.success);
    assert!(!result.context.contains_key("skipped"));
    assert_eq!(result.context["ran"], "ran");
    assert_eq!(result.history.map(|h| h.len()), Some(2));
    assert_eq!(h.primary.count(), 2);
}

#[tokio::test]
async fn test_invalid_condition_fails_the_workflow() {
    let h = harness();
    let steps = vec![echo("primary", "never").with_condition("{{status}}.includes('x')")];

    let result = h
        .orchestrator
        .execute_workflow(
            &steps,
            object(json!({"status": "ok"})),
            ExecutionOptions::default(),
        )
        .await
        .expect("workflow returns a result");

    assert!(!result.success);
    let error = result.error.expect("error message");
    assert!(error.contains("Failed to evaluate condition"), "{error}");
    assert_eq!(h.primary.count(), 0);
    assert_eq!(result.context["status"], "ok");
}

#[tokio::test]
async fn test_deeply_nested_condition_fails_the_workflow() {
    let h = harness();
    let condition = format!("{}true{}", "(".repeat(200_000), ")".repeat(200_000));
    let steps = vec![echo("primary", "never").with_condition(condition)];

    let result = h
        .orchestrator
        .execute_workflow(&steps, Map::new(), ExecutionOptions::default())
        .await
        .expect("workflow returns a result");

    assert!(!result.success);
    let error = result.error.expect("error message");
    assert!(error.contains("Failed to evaluate condition"), "{error}");
    assert_eq!(h.primary.count(), 0);
}

#[tokio::test]
async fn test_unknown_server_is_a_step_failure() {
    let h = harness();
    let steps = vec![
        echo("nowhere", "x").with_on_error(ErrorPolicy::Continue),
        echo("nowhere", "y"),
    ];

    let result = h
        .orchestrator
        .execute_workflow(&steps, Map::new(), ExecutionOptions::with_history())
        .await
        .expect("workflow returns a result");

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Server not found: nowhere"));
    assert_eq!(result.history.map(|h| h.len()), Some(2));
}

#[tokio::test]
async fn test_definitions_load_from_toml_and_json() {
    let dir = tempfile::tempdir().expect("tempdir");

    let toml_path = dir.path().join("search.toml");
    std::fs::write(
        &toml_path,
        r#"
name = "search"

[[steps]]
server = "primary"
tool = "echo"
outputVar = "answer"
args = { text = "{{query}}" }

[steps.onError]
server = "backup"
tool = "echo"
outputVar = "answer"
args = { text = "backup {{query}}" }

[[steps]]
server = "primary"
tool = "echo"
condition = "'{{answer}}' !== ''"
onError = "continue"
"#,
    )
    .expect("write toml");

    let definition = WorkflowDefinition::load(&toml_path).expect("toml loads");
    assert_eq!(definition.name.as_deref(), Some("search"));
    assert_eq!(definition.steps.len(), 2);
    assert!(matches!(definition.steps[0].on_error, ErrorPolicy::Fallback(_)));
    assert_eq!(definition.steps[1].on_error, ErrorPolicy::Continue);

    let json_path = dir.path().join("search.json");
    std::fs::write(
        &json_path,
        serde_json::to_string(&definition).expect("serialize"),
    )
    .expect("write json");
    assert_eq!(WorkflowDefinition::load(&json_path).expect("json loads"), definition);

    let yaml_path = dir.path().join("search.yaml");
    std::fs::write(&yaml_path, "steps: []").expect("write yaml");
    assert!(WorkflowDefinition::load(&yaml_path).is_err());

    let h = harness();
    let result = h
        .orchestrator
        .execute_workflow(
            &definition.steps,
            object(json!({"query": "rust"})),
            ExecutionOptions::default(),
        )
        .await
        .expect("workflow runs");
    assert!(result.success);
    assert_eq!(result.context["answer"], "rust");
}
