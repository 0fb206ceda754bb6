pub mod render;
mod repl;

use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::agent::ChatSession;
use crate::config::AppConfig;
use crate::llm::OpenAIClient;
use crate::tools::{SharedRegistry, ToolRegistry};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "toolchat",
    version,
    about = "Chat with a text-only model that can call local tools"
)]
pub struct Cli {
    /// OpenAI-compatible API base URL (scheme optional)
    #[arg(long)]
    pub base_url: Option<String>,

    /// Model name
    #[arg(long)]
    pub model: Option<String>,

    /// API key (set via env TOOLCHAT_API_KEY or OPENAI_API_KEY recommended)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Send one prompt, print the answer and exit
    #[arg(short, long)]
    pub prompt: Option<String>,

    /// JSON list of tool sources ({"mcps": [{name, description, path}]})
    #[arg(long)]
    pub tools_file: Option<PathBuf>,

    /// System prompt template with a {tool_descriptions} placeholder
    #[arg(long)]
    pub prompt_file: Option<PathBuf>,

    /// Upper bound on model turns per request
    #[arg(long)]
    pub max_iterations: Option<usize>,

    /// Disable streaming responses
    #[arg(long, action = ArgAction::SetTrue)]
    pub no_stream: bool,

    /// Log level (error,warn,info,debug,trace)
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, action = ArgAction::SetTrue)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List tool sources, their tools and parameters
    Tools {
        /// Print the chat-completions function table instead
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Run one tool directly
    Call {
        tool: String,
        /// Arguments as a JSON object
        args: Option<String>,
    },
    /// Check connectivity to the model endpoint
    Status,
}

pub(crate) fn tool_timeout(cfg: &AppConfig) -> Duration {
    Duration::from_millis(cfg.tools.timeout_ms)
}

fn load_registry(cfg: &AppConfig) -> ToolRegistry {
    ToolRegistry::load(&cfg.resolved_tool_sources(), tool_timeout(cfg))
}

fn build_client(cfg: &AppConfig) -> Result<OpenAIClient> {
    let key = cfg
        .api_key
        .clone()
        .ok_or_else(|| anyhow!("no API key configured; set TOOLCHAT_API_KEY or OPENAI_API_KEY"))?;
    Ok(OpenAIClient::new(&cfg.base_url, key, &cfg.model)?.with_llm_config(cfg.llm.clone()))
}

pub(crate) fn load_system_prompt(cfg: &AppConfig, registry: &ToolRegistry) -> String {
    let template = cfg.prompt_file.as_ref().and_then(|p| match std::fs::read_to_string(p) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(path=%p.display(), error=%e, "system prompt template not readable, using default");
            None
        }
    });
    render::system_prompt(template.as_deref(), registry)
}

/// Parses `call` arguments. Absent means no arguments.
fn parse_call_args(raw: Option<&str>) -> Result<serde_json::Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(serde_json::Map::new());
    };
    match serde_json::from_str::<Value>(raw).context("parse tool arguments")? {
        Value::Object(map) => Ok(map),
        other => bail!("tool arguments must be a JSON object, got {other}"),
    }
}

pub async fn run(cli: Cli, cfg: AppConfig) -> Result<()> {
    match &cli.command {
        Some(Command::Tools { json }) => {
            let registry = load_registry(&cfg);
            if *json {
                println!("{}", serde_json::to_string_pretty(&registry.function_defs())?);
            } else {
                println!("{}", render::tool_listing(&registry));
            }
            Ok(())
        }
        Some(Command::Call { tool, args }) => {
            let registry = load_registry(&cfg);
            let args = parse_call_args(args.as_deref())?;
            let res = registry.execute_detailed(tool, &args).await;
            println!("{}", render::tool_result(&res.output));
            if res.is_error {
                bail!("tool '{tool}' failed");
            }
            Ok(())
        }
        Some(Command::Status) => {
            let client = build_client(&cfg)?;
            let status = client.check_connection().await;
            info!(state = ?status.state, "connection probe");
            println!("{}: {status}", client.base_url);
            if !status.connected {
                bail!("endpoint not reachable");
            }
            Ok(())
        }
        None => run_chat(cli, cfg).await,
    }
}

async fn run_chat(cli: Cli, cfg: AppConfig) -> Result<()> {
    let client = Arc::new(build_client(&cfg)?);
    repl::banner_header(&cfg);
    let status = client.check_connection().await;
    if status.connected {
        println!("✓ Connected to {}", client.base_url);
    } else {
        println!("⚠ Connection check failed: {status}");
        println!("  (requests will still be attempted)");
    }

    let registry = Arc::new(SharedRegistry::new(load_registry(&cfg)));
    let snapshot = registry.snapshot();
    if snapshot.is_empty() {
        println!("⚠ No tools loaded");
    } else {
        println!(
            "✓ Loaded {} tools: {}",
            snapshot.len(),
            snapshot.list_tools().join(", ")
        );
        println!("  sources: {}", snapshot.list_servers().join(", "));
    }
    let system_prompt = load_system_prompt(&cfg, &snapshot);
    println!("✓ System prompt loaded ({} chars)", system_prompt.chars().count());
    info!(tools = snapshot.len(), max_iterations = cfg.agent.max_iterations, "session ready");

    let session = ChatSession::new(client.clone(), registry.clone(), cfg.agent.clone(), system_prompt);
    let mut repl = repl::Repl::new(cfg, client, registry, session);
    match cli.prompt {
        Some(prompt) => repl.one_shot(&prompt).await,
        None => repl.run().await,
    }
}
