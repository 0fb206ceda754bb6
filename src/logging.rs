use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// `RUST_LOG` wins over `level` when set.
fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber. With `log_file` the output goes there
/// without ANSI colours, otherwise to stderr so it stays out of the chat
/// output on stdout.
pub fn init_logging(level: &str, log_file: Option<&Path>, json: bool) -> Result<()> {
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter(level))
        .with_file(true)
        .with_line_number(true);

    match (log_file, json) {
        (Some(path), json) => {
            let file = Arc::new(
                std::fs::File::create(path)
                    .with_context(|| format!("create log file: {}", path.display()))?,
            );
            let builder = builder.with_ansi(false).with_writer(file);
            if json {
                tracing::subscriber::set_global_default(builder.json().finish())?;
            } else {
                tracing::subscriber::set_global_default(builder.finish())?;
            }
        }
        (None, true) => {
            tracing::subscriber::set_global_default(
                builder.with_writer(std::io::stderr).json().finish(),
            )?;
        }
        (None, false) => {
            tracing::subscriber::set_global_default(builder.with_writer(std::io::stderr).finish())?;
        }
    }
    info!("logging initialized");
    Ok(())
}
