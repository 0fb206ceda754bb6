pub mod manifest;
pub mod registry;
pub mod schema;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

pub use manifest::ManifestSource;
pub use registry::{SharedRegistry, ToolRegistry};
pub use schema::{Param, ParamSchema};

/// Something a tool name dispatches to. Arguments arrive already bound
/// against the tool's [`ParamSchema`].
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, args: &Map<String, Value>) -> Result<Value>;
}

/// Adapts a plain closure into a handler.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> ToolHandler for FnHandler<F>
where
    F: Fn(&Map<String, Value>) -> Result<Value> + Send + Sync,
{
    async fn invoke(&self, args: &Map<String, Value>) -> Result<Value> {
        (self.0)(args)
    }
}

#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// Name of the source the tool was discovered in.
    pub source: String,
    pub schema: ParamSchema,
    pub handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("source", &self.source)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// A loadable unit that contributes tools to the registry.
pub trait ToolSource: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn discover(&self) -> Result<Vec<ToolDefinition>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolExecutionResult {
    pub tool_name: String,
    pub output: String,
    pub is_error: bool,
}
