use anyhow::Result;
use std::io::{self, Write};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use crate::agent::{AgentEvent, ChatSession, EventReceiver};
use crate::cli::{load_system_prompt, render, tool_timeout};
use crate::config::AppConfig;
use crate::llm::OpenAIClient;
use crate::tools::SharedRegistry;

const RULE_WIDTH: usize = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Help,
    Tools,
    Status,
    Reload,
    Clear,
    Quit,
    Unknown(String),
}

/// `None` for lines that are chat input rather than commands.
pub fn parse_command(line: &str) -> Option<ReplCommand> {
    let line = line.trim();
    if !line.starts_with('/') {
        return None;
    }
    let cmd = line.split_whitespace().next().unwrap_or(line);
    Some(match cmd {
        "/help" => ReplCommand::Help,
        "/tools" => ReplCommand::Tools,
        "/status" => ReplCommand::Status,
        "/reload" => ReplCommand::Reload,
        "/clear" => ReplCommand::Clear,
        "/quit" | "/exit" => ReplCommand::Quit,
        other => ReplCommand::Unknown(other.to_string()),
    })
}

pub fn print_help() {
    println!(
        "/help    Show help\n/tools   Show loaded tools\n/status  Check the model endpoint\n/reload  Reload tool sources\n/clear   Start a new conversation\n/quit    Quit\nCtrl-C stops a running answer."
    );
}

pub(crate) fn banner_header(cfg: &AppConfig) {
    println!("{}", "=".repeat(RULE_WIDTH));
    println!("toolchat");
    println!("{}", "=".repeat(RULE_WIDTH));
    println!("API Host: {}", cfg.base_url);
    println!("Model: {}", cfg.model);
    println!("{}", "-".repeat(RULE_WIDTH));
}

pub struct Repl {
    cfg: AppConfig,
    client: Arc<OpenAIClient>,
    registry: Arc<SharedRegistry>,
    session: ChatSession,
}

impl Repl {
    pub fn new(
        cfg: AppConfig,
        client: Arc<OpenAIClient>,
        registry: Arc<SharedRegistry>,
        session: ChatSession,
    ) -> Self {
        Self {
            cfg,
            client,
            registry,
            session,
        }
    }

    pub async fn one_shot(&mut self, prompt: &str) -> Result<()> {
        let rx = self.session.submit(prompt).await;
        let failed = self.drive(rx).await?;
        self.session.wait().await;
        if failed {
            anyhow::bail!("request failed");
        }
        Ok(())
    }

    pub async fn run(&mut self) -> Result<()> {
        println!("{}", "=".repeat(RULE_WIDTH));
        println!("type /help for commands");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            print!("> ");
            io::stdout().flush()?;
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => {
                    if self.session.is_busy() {
                        // a stopped request may still be unwinding
                        self.session.cancel();
                        println!();
                        continue;
                    }
                    println!();
                    break;
                }
            };
            let Some(line) = line else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_command(&line) {
                Some(ReplCommand::Quit) => break,
                Some(cmd) => self.handle_command(cmd).await,
                None => {
                    let rx = self.session.submit(line.trim()).await;
                    self.drive(rx).await?;
                }
            }
        }
        self.session.clear().await;
        Ok(())
    }

    async fn handle_command(&mut self, cmd: ReplCommand) {
        match cmd {
            ReplCommand::Help => print_help(),
            ReplCommand::Tools => println!("{}", self.registry.snapshot().describe_all().trim_start()),
            ReplCommand::Status => {
                let status = self.client.check_connection().await;
                let mark = if status.connected { "✓" } else { "⚠" };
                println!("{mark} {} ({})", status, self.client.model);
                println!("{} messages in this conversation", self.session.history().len());
            }
            ReplCommand::Reload => {
                let reg = self
                    .registry
                    .reload(&self.cfg.resolved_tool_sources(), tool_timeout(&self.cfg));
                self.session.set_system_prompt(load_system_prompt(&self.cfg, &reg));
                info!(tools = reg.len(), "tool sources reloaded");
                println!("✓ Reloaded {} tools: {}", reg.len(), reg.list_tools().join(", "));
            }
            ReplCommand::Clear => {
                self.session.clear().await;
                println!("conversation cleared");
            }
            ReplCommand::Quit => {}
            ReplCommand::Unknown(c) => println!("unknown command {c}; try /help"),
        }
    }

    /// Prints events until the request ends. Ctrl-C cancels it. Returns
    /// whether the request reported an error.
    async fn drive(&self, mut rx: EventReceiver) -> Result<bool> {
        let mut stdout = io::stdout();
        let mut failed = false;
        loop {
            tokio::select! {
                ev = rx.recv() => {
                    let Some(ev) = ev else { break };
                    match ev {
                        AgentEvent::Chunk(c) => {
                            print!("{c}");
                            stdout.flush()?;
                        }
                        AgentEvent::ToolCallStarted(name) => println!("\n🔧 Executing tool: {name}..."),
                        AgentEvent::ToolResult { name, output } => {
                            println!("📋 {name}:\n{}", render::tool_result(&output));
                        }
                        AgentEvent::Finished(_) => println!(),
                        AgentEvent::Error(e) => {
                            failed = true;
                            eprintln!("\n❌ Error: {e}");
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    debug!("ctrl-c, cancelling request");
                    self.session.cancel();
                    println!(" [Stopped]");
                    break;
                }
            }
        }
        Ok(failed)
    }
}
