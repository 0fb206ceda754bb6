mod agent;
mod cli;
mod config;
mod llm;
mod logging;
mod tools;

use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use tracing::info;

use crate::cli::Cli;
use crate::config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level, cli.log_file.as_deref(), cli.log_json)?;

    let cfg = AppConfig::from_cli(&cli)?;
    info!(
        base_url = %cfg.base_url,
        model = %cfg.model,
        tool_sources = cfg.tool_sources.len(),
        tool_sources_file = ?cfg.tool_sources_file,
        stream = cfg.agent.stream,
        "app config"
    );

    cli::run(cli, cfg).await
}
