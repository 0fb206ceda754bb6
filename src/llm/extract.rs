//! Recovers tool calls from free-form assistant text.
//!
//! Models without native function calling format their calls inconsistently,
//! so extraction is a cascade of independent matchers. Each matcher yields
//! candidate JSON spans; a span that does not parse is dropped and the
//! cascade continues. The first call seen for a given tool name wins.

use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::debug;

use crate::llm::types::ToolCall;

/// One way of spotting tool-call JSON inside text.
pub trait CallMatcher: Send + Sync {
    fn label(&self) -> &'static str;

    /// Candidate spans, in the order they occur in `text`.
    fn candidates<'a>(&self, text: &'a str) -> Vec<&'a str>;
}

fn fenced_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"```(?:tool_calls?|json)?\s*\n?\s*(\{[^`]*?"tool"\s*:\s*"[^"]+?"[^`]*?\})\s*\n?```"#)
            .expect("fenced tool-call pattern is valid")
    })
}

fn tool_first_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\{\s*"tool"\s*:"#).expect("inline tool pattern is valid"))
}

fn arguments_first_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\{\s*"arguments"\s*:"#).expect("inline arguments pattern is valid")
    })
}

/// ```` ```tool_call ```` / ```` ```json ```` / bare ```` ``` ```` blocks.
pub struct FencedBlock;

impl CallMatcher for FencedBlock {
    fn label(&self) -> &'static str {
        "fenced"
    }

    fn candidates<'a>(&self, text: &'a str) -> Vec<&'a str> {
        fenced_re()
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect()
    }
}

/// A bare object whose first key matches `opening`; the span runs to the
/// matching closing brace so nested arguments survive.
fn inline_objects<'a>(re: &Regex, text: &'a str) -> Vec<&'a str> {
    let mut out = Vec::new();
    let mut covered_until = 0usize;
    for m in re.find_iter(text) {
        if m.start() < covered_until {
            continue;
        }
        if let Some(span) = balanced_object(text, m.start()) {
            covered_until = m.start() + span.len();
            out.push(span);
        }
    }
    out
}

/// `{"tool": "...", "arguments": {...}}` in running text.
pub struct InlineToolFirst;

impl CallMatcher for InlineToolFirst {
    fn label(&self) -> &'static str {
        "inline-tool-first"
    }

    fn candidates<'a>(&self, text: &'a str) -> Vec<&'a str> {
        inline_objects(tool_first_re(), text)
    }
}

/// `{"arguments": {...}, "tool": "..."}` in running text.
pub struct InlineArgumentsFirst;

impl CallMatcher for InlineArgumentsFirst {
    fn label(&self) -> &'static str {
        "inline-arguments-first"
    }

    fn candidates<'a>(&self, text: &'a str) -> Vec<&'a str> {
        inline_objects(arguments_first_re(), text)
    }
}

/// Last resort: every brace-balanced span mentioning the `"tool"` key.
pub struct BraceScan;

impl CallMatcher for BraceScan {
    fn label(&self) -> &'static str {
        "brace-scan"
    }

    fn candidates<'a>(&self, text: &'a str) -> Vec<&'a str> {
        text.match_indices('{')
            .filter_map(|(i, _)| balanced_object(text, i))
            .filter(|span| span.contains("\"tool\""))
            .collect()
    }
}

/// Returns the `{...}` span starting at byte `start`, honouring JSON string
/// quoting. `None` when the braces never balance.
fn balanced_object(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    if bytes.get(start) != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parses one candidate span. Non-object JSON, or a missing/empty/non-string
/// `tool`, is not a call.
pub fn parse_candidate(span: &str) -> Option<ToolCall> {
    let Value::Object(mut obj) = serde_json::from_str::<Value>(span).ok()? else {
        return None;
    };
    let name = match obj.get("tool") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => return None,
    };
    let arguments = obj.remove("arguments").unwrap_or(Value::Null);
    Some(ToolCall::new(name, arguments))
}

pub struct ToolCallExtractor {
    primary: Vec<Box<dyn CallMatcher>>,
    fallback: Option<Box<dyn CallMatcher>>,
}

impl Default for ToolCallExtractor {
    fn default() -> Self {
        Self {
            primary: vec![
                Box::new(FencedBlock),
                Box::new(InlineToolFirst),
                Box::new(InlineArgumentsFirst),
            ],
            fallback: Some(Box::new(BraceScan)),
        }
    }
}

impl ToolCallExtractor {
    pub fn extract(&self, text: &str) -> Vec<ToolCall> {
        let mut seen = HashSet::new();
        let mut calls = Vec::new();
        for matcher in &self.primary {
            collect(matcher.as_ref(), text, &mut seen, &mut calls);
        }
        if calls.is_empty()
            && let Some(fallback) = &self.fallback
        {
            collect(fallback.as_ref(), text, &mut seen, &mut calls);
        }
        calls
    }
}

fn collect(
    matcher: &dyn CallMatcher,
    text: &str,
    seen: &mut HashSet<String>,
    calls: &mut Vec<ToolCall>,
) {
    let before = calls.len();
    for span in matcher.candidates(text) {
        let Some(call) = parse_candidate(span) else {
            continue;
        };
        if seen.insert(call.name.clone()) {
            calls.push(call);
        }
    }
    if calls.len() > before {
        debug!(matcher = matcher.label(), found = calls.len() - before, "tool calls extracted");
    }
}

/// Runs the default cascade.
pub fn parse_tool_calls(text: &str) -> Vec<ToolCall> {
    static EXTRACTOR: OnceLock<ToolCallExtractor> = OnceLock::new();
    EXTRACTOR.get_or_init(ToolCallExtractor::default).extract(text)
}
