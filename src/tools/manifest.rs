//! TOML tool manifests.
//!
//! A manifest declares its tools either as a structured table:
//!
//! ```toml
//! [tools.get_quota]
//! description = "Show storage quotas"
//! signature = "(user: str = \"\")"
//! command = ["./quota.sh"]
//! ```
//!
//! or as a flat list of functions that is filtered the way a module scan
//! would be:
//!
//! ```toml
//! [[functions]]
//! name = "list_partitions"
//! doc = "List cluster partitions.\n\nReturns JSON."
//! signature = "()"
//! command = ["sinfo-json"]
//! ```
//!
//! When both are present the structured table is used.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::tools::schema::{ParamSchema, SignatureError};
use crate::tools::{ToolDefinition, ToolHandler, ToolSource};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("read manifest {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse manifest {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("tool '{tool}' has an empty command")]
    EmptyCommand { tool: String },
    #[error("tool '{tool}' has an invalid signature")]
    Signature {
        tool: String,
        #[source]
        source: SignatureError,
    },
}

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    tools: BTreeMap<String, ToolEntry>,
    #[serde(default)]
    functions: Vec<FunctionEntry>,
}

#[derive(Debug, Deserialize)]
struct ToolEntry {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    doc: Option<String>,
    #[serde(default = "empty_signature")]
    signature: String,
    command: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FunctionEntry {
    name: String,
    #[serde(default)]
    doc: String,
    #[serde(default = "empty_signature")]
    signature: String,
    command: Vec<String>,
}

fn empty_signature() -> String {
    "()".to_string()
}

fn first_line(doc: &str) -> String {
    doc.trim().lines().next().unwrap_or_default().trim().to_string()
}

/// A tool source backed by a manifest file on disk.
#[derive(Debug, Clone)]
pub struct ManifestSource {
    name: String,
    description: String,
    path: PathBuf,
    timeout: Duration,
}

impl ManifestSource {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        path: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            path: path.into(),
            timeout,
        }
    }

    fn read_manifest(&self) -> Result<Manifest, ManifestError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| ManifestError::Read {
            path: self.path.clone(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ManifestError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn definition(
        &self,
        name: String,
        description: String,
        signature: &str,
        command: Vec<String>,
    ) -> Result<ToolDefinition, ManifestError> {
        if command.is_empty() {
            return Err(ManifestError::EmptyCommand { tool: name });
        }
        let schema = ParamSchema::parse(signature).map_err(|source| ManifestError::Signature {
            tool: name.clone(),
            source,
        })?;
        let cwd = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(ToolDefinition {
            name,
            description,
            source: self.name.clone(),
            schema,
            handler: Arc::new(CommandHandler::new(command, cwd, self.timeout)),
        })
    }
}

impl ToolSource for ManifestSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn discover(&self) -> Result<Vec<ToolDefinition>> {
        let manifest = self.read_manifest()?;
        let mut defs = Vec::new();

        if !manifest.tools.is_empty() {
            debug!(source=%self.name, count = manifest.tools.len(), "structured tool table");
            for (name, entry) in manifest.tools {
                let description = entry
                    .description
                    .filter(|d| !d.trim().is_empty())
                    .or_else(|| entry.doc.as_deref().map(first_line))
                    .unwrap_or_default();
                defs.push(self.definition(name, description, &entry.signature, entry.command)?);
            }
            return Ok(defs);
        }

        for f in manifest.functions {
            if f.name.starts_with('_') || f.name == "main" || f.doc.trim().is_empty() {
                debug!(source=%self.name, function=%f.name, "skipping function");
                continue;
            }
            let description = first_line(&f.doc);
            defs.push(self.definition(f.name, description, &f.signature, f.command)?);
        }
        Ok(defs)
    }
}

/// Runs an external command per invocation: the bound arguments are written
/// to stdin as a JSON object and stdout is the result.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    argv: Vec<String>,
    cwd: PathBuf,
    timeout: Duration,
}

impl CommandHandler {
    pub fn new(argv: Vec<String>, cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            argv,
            cwd: cwd.into(),
            timeout,
        }
    }

    fn program(&self) -> Option<PathBuf> {
        let first = self.argv.first()?;
        let p = Path::new(first);
        if p.is_relative() && p.components().count() > 1 {
            Some(self.cwd.join(p))
        } else {
            Some(p.to_path_buf())
        }
    }
}

#[async_trait]
impl ToolHandler for CommandHandler {
    async fn invoke(&self, args: &Map<String, Value>) -> Result<Value> {
        let Some(program) = self.program() else {
            bail!("empty command");
        };
        let input = serde_json::to_vec(args).context("encode tool arguments")?;

        let mut child = Command::new(&program)
            .args(&self.argv[1..])
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to execute command: {}", program.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            // a tool that never reads stdin closes the pipe early
            if let Err(e) = stdin.write_all(&input).await {
                debug!(err=%e, "tool stdin closed early");
            }
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(res) => res.context("wait for tool process")?,
            Err(_) => {
                warn!(program=%program.display(), timeout_ms = self.timeout.as_millis() as u64, "tool timed out");
                bail!("timed out after {}ms", self.timeout.as_millis());
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Command failed with status {}: {}", output.status, stderr.trim());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(Value::String(stdout.trim_end().to_string()))
    }
}
