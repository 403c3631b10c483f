//! Command-line arguments.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG: &str = "lattice.toml";

#[derive(Debug, Parser)]
#[command(name = "lattice", version, about = "Inspect MCP servers, call tools and run workflows")]
pub struct Cli {
    /// Server configuration file (.toml or .json).
    #[arg(short, long, global = true, env = "LATTICE_CONFIG", default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace). Ignored when RUST_LOG is set.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List configured servers.
    #[command(visible_alias = "ls")]
    Servers(ServersArgs),

    /// Connect and list the tools servers expose.
    Tools(ToolsArgs),

    /// Call a single tool.
    Call(CallArgs),

    /// Run a workflow file.
    Run(RunArgs),

    /// List the prompts servers expose.
    Prompts(CatalogArgs),

    /// List the resources servers expose.
    Resources(CatalogArgs),

    /// Ask a model that can use every connected tool.
    Ask(AskArgs),
}

#[derive(Debug, clap::Args)]
pub struct ServersArgs {
    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, clap::Args)]
pub struct ToolsArgs {
    /// Only this server (id or name).
    #[arg(short, long)]
    pub server: Option<String>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, clap::Args)]
pub struct CallArgs {
    /// Server id or name.
    pub server: String,

    /// Tool name.
    pub tool: String,

    /// Arguments as a JSON object.
    #[arg(short, long, default_value = "{}")]
    pub args: String,

    /// Print the raw result as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Workflow definition (.toml or .json).
    pub workflow: PathBuf,

    /// Initial context as a JSON object.
    #[arg(long, default_value = "{}")]
    pub context: String,

    /// Record and print the execution history.
    #[arg(long)]
    pub history: bool,

    /// Print the full result as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, clap::Args)]
pub struct CatalogArgs {
    /// Only this server (id or name).
    #[arg(short, long)]
    pub server: Option<String>,
}

#[derive(Debug, clap::Args)]
pub struct AskArgs {
    /// The question.
    #[arg(required = true, num_args = 1..)]
    pub prompt: Vec<String>,

    /// Model name.
    #[arg(short, long, env = "LATTICE_MODEL")]
    pub model: String,

    /// Root of an OpenAI-compatible API.
    #[arg(long, env = "LATTICE_API_BASE", default_value = "http://localhost:1234/v1")]
    pub api_base: String,

    /// API key sent as a bearer token.
    #[arg(long, env = "LATTICE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Extra instructions appended to the system prompt.
    #[arg(long)]
    pub system: Option<String>,
}
