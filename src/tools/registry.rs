use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::ToolSourceConfig;
use crate::llm::types::{ToolCall, ToolDef, ToolFunctionDef};
use crate::tools::{ManifestSource, ToolDefinition, ToolExecutionResult, ToolSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub description: String,
    /// Tool names in discovery order.
    pub tools: Vec<String>,
}

/// Name-keyed tool table. Read-only once built; see [`SharedRegistry`] for
/// swapping in a reloaded one.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    servers: Vec<ServerInfo>,
    tools: HashMap<String, ToolDefinition>,
    order: Vec<String>,
}

fn error_payload(message: String) -> String {
    json!({ "error": message }).to_string()
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every descriptor in order. A source that is missing or fails
    /// to load is logged and skipped.
    pub fn load(descriptors: &[ToolSourceConfig], timeout: Duration) -> Self {
        let sources: Vec<ManifestSource> = descriptors
            .iter()
            .filter(|d| {
                if d.path.as_os_str().is_empty() {
                    warn!(source=%d.name, "tool source has no path");
                    return false;
                }
                if !d.path.exists() {
                    warn!(source=%d.name, path=%d.path.display(), "tool source file not found");
                    return false;
                }
                true
            })
            .map(|d| ManifestSource::new(&d.name, &d.description, &d.path, timeout))
            .collect();
        let refs: Vec<&dyn ToolSource> = sources.iter().map(|s| s as &dyn ToolSource).collect();
        Self::from_sources(&refs)
    }

    pub fn from_sources(sources: &[&dyn ToolSource]) -> Self {
        let mut reg = Self::new();
        for src in sources {
            reg.add_source(*src);
        }
        reg
    }

    /// Registers every tool `source` discovers. Returns how many were added.
    pub fn add_source(&mut self, source: &dyn ToolSource) -> usize {
        let defs = match source.discover() {
            Ok(defs) => defs,
            Err(e) => {
                warn!(source=%source.name(), error=%format!("{e:#}"), "failed to load tool source");
                return 0;
            }
        };

        let server = ServerInfo {
            name: source.name().to_string(),
            description: source.description().to_string(),
            tools: defs.iter().map(|d| d.name.clone()).collect(),
        };
        let count = defs.len();
        for def in defs {
            self.insert(def);
        }
        match self.servers.iter_mut().find(|s| s.name == server.name) {
            Some(existing) => *existing = server,
            None => self.servers.push(server),
        }
        info!(source=%source.name(), tools = count, "loaded tool source");
        count
    }

    /// Last registration of a name wins.
    pub fn insert(&mut self, def: ToolDefinition) {
        if let Some(prev) = self.tools.get(&def.name) {
            warn!(tool=%def.name, previous=%prev.source, replacement=%def.source, "tool name collision, replacing");
        } else {
            self.order.push(def.name.clone());
        }
        self.tools.insert(def.name.clone(), def);
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn servers(&self) -> &[ServerInfo] {
        &self.servers
    }

    pub fn list_servers(&self) -> Vec<String> {
        self.servers.iter().map(|s| s.name.clone()).collect()
    }

    pub fn list_tools(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Tool table in the chat-completions function format.
    pub fn function_defs(&self) -> Vec<ToolDef> {
        self.order
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| ToolDef {
                kind: "function".to_string(),
                function: ToolFunctionDef {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.schema.to_json_schema(),
                },
            })
            .collect()
    }

    /// Markdown listing of servers and their tools, for system prompts.
    pub fn describe_all(&self) -> String {
        let mut lines = Vec::new();
        for server in &self.servers {
            lines.push(format!("\n## {}", server.name));
            if !server.description.is_empty() {
                lines.push(server.description.clone());
            }
            for name in &server.tools {
                let description = self
                    .tools
                    .get(name)
                    .map(|t| t.description.as_str())
                    .unwrap_or_default();
                lines.push(format!("\n- **{name}**: {description}"));
            }
        }
        lines.join("\n")
    }

    /// Runs a tool. Never fails: unknown names and handler errors come back
    /// as `{"error": ...}` text.
    pub async fn execute(&self, name: &str, arguments: &Map<String, Value>) -> String {
        self.execute_detailed(name, arguments).await.output
    }

    pub async fn execute_call(&self, call: &ToolCall) -> ToolExecutionResult {
        self.execute_detailed(&call.name, &call.arguments).await
    }

    pub async fn execute_detailed(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> ToolExecutionResult {
        let result = |output: String, is_error: bool| ToolExecutionResult {
            tool_name: name.to_string(),
            output,
            is_error,
        };

        let Some(tool) = self.tools.get(name) else {
            warn!(tool=%name, "unknown tool requested");
            return result(error_payload(format!("Unknown tool: {name}")), true);
        };

        let bound = match tool.schema.bind(arguments) {
            Ok(b) => b,
            Err(e) => {
                warn!(tool=%name, error=%e, "tool argument binding failed");
                return result(error_payload(format!("Tool execution error: {e}")), true);
            }
        };

        match tool.handler.invoke(&bound).await {
            Ok(Value::String(s)) => result(s, false),
            Ok(other) => result(other.to_string(), false),
            Err(e) => {
                warn!(tool=%name, error=%format!("{e:#}"), "tool execution failed");
                result(error_payload(format!("Tool execution error: {e:#}")), true)
            }
        }
    }
}

/// Registry handle that can be swapped wholesale on reload. Readers take a
/// snapshot `Arc` and never observe a half-built table.
#[derive(Debug, Default)]
pub struct SharedRegistry {
    inner: RwLock<Arc<ToolRegistry>>,
}

impl SharedRegistry {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            inner: RwLock::new(Arc::new(registry)),
        }
    }

    pub fn snapshot(&self) -> Arc<ToolRegistry> {
        match self.inner.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, registry: ToolRegistry) {
        let next = Arc::new(registry);
        match self.inner.write() {
            Ok(mut g) => *g = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Builds a fresh registry from `descriptors` and swaps it in.
    pub fn reload(&self, descriptors: &[ToolSourceConfig], timeout: Duration) -> Arc<ToolRegistry> {
        self.replace(ToolRegistry::load(descriptors, timeout));
        self.snapshot()
    }
}
