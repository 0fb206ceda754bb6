use serde_json::Value;

use crate::tools::{Param, ToolRegistry};

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are an HPC assistant with access to cluster management tools.";
pub const TOOL_RESULT_PREVIEW_CHARS: usize = 500;

/// Appended to every system prompt that does not already explain the
/// tool-call format.
pub const TOOL_CALL_INSTRUCTIONS: &str = r#"When you need a tool, reply with a fenced block like this and nothing after it:

```tool_call
{"tool": "<tool name>", "arguments": {"<parameter>": <value>}}
```

You may include several blocks to call several tools. The results will be sent back to you in the next message; use them to answer the user."#;

/// Fills `{tool_descriptions}` in a template. `{{` and `}}` stand for
/// literal braces.
pub fn fill_template(template: &str, tool_descriptions: &str) -> String {
    const SLOT: &str = "{tool_descriptions}";
    template
        .split(SLOT)
        .map(|part| part.replace("{{", "{").replace("}}", "}"))
        .collect::<Vec<_>>()
        .join(tool_descriptions)
}

pub fn system_prompt(template: Option<&str>, registry: &ToolRegistry) -> String {
    let base = match template {
        Some(t) => fill_template(t, &registry.describe_all()),
        None => {
            let descriptions = registry.describe_all();
            if descriptions.is_empty() {
                DEFAULT_SYSTEM_PROMPT.to_string()
            } else {
                format!("{DEFAULT_SYSTEM_PROMPT}\n\nAvailable tools:\n{descriptions}")
            }
        }
    };
    if base.contains("```tool_call") {
        base
    } else {
        format!("{}\n\n{TOOL_CALL_INSTRUCTIONS}", base.trim_end())
    }
}

/// Pretty-prints JSON output and caps it for display.
pub fn tool_result(output: &str) -> String {
    let pretty = serde_json::from_str::<Value>(output)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| output.to_string());
    if pretty.chars().count() > TOOL_RESULT_PREVIEW_CHARS {
        let cut: String = pretty.chars().take(TOOL_RESULT_PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        pretty
    }
}

fn param(p: &Param) -> String {
    match &p.default {
        Some(d) => format!("{}: {} = {}", p.name, p.kind.as_str(), d),
        None => format!("{}: {}", p.name, p.kind.as_str()),
    }
}

/// Servers, their tools and parameter lists.
pub fn tool_listing(registry: &ToolRegistry) -> String {
    if registry.servers().is_empty() {
        return "No tools loaded".to_string();
    }
    let mut out = Vec::new();
    for server in registry.servers() {
        if server.description.is_empty() {
            out.push(format!("{} ({} tools)", server.name, server.tools.len()));
        } else {
            out.push(format!(
                "{} ({} tools): {}",
                server.name,
                server.tools.len(),
                server.description
            ));
        }
        for name in &server.tools {
            let Some(t) = registry.get(name) else {
                continue;
            };
            let params: Vec<String> = t.schema.params.iter().map(param).collect();
            let mut line = format!("  {}({})", t.name, params.join(", "));
            if t.source != server.name {
                line.push_str(&format!(" [overridden by {}]", t.source));
            } else if !t.description.is_empty() {
                line.push_str(&format!("  {}", t.description));
            }
            out.push(line);
        }
    }
    out.join("\n")
}
