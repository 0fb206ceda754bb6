//! Parameter schemas inferred from callable-style signature strings such as
//! `(partition: str, limit: int = 50, verbose: bool = false)`.

use serde_json::{Map, Value, json};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Integer,
    Number,
    Boolean,
    Array,
    String,
}

impl ParamType {
    /// Maps an annotation to its JSON type. Unknown and missing annotations
    /// are strings.
    pub fn from_annotation(annotation: Option<&str>) -> Self {
        let Some(raw) = annotation.map(str::trim) else {
            return ParamType::String;
        };
        match raw {
            "int" => ParamType::Integer,
            "float" => ParamType::Number,
            "bool" => ParamType::Boolean,
            "list" | "List" => ParamType::Array,
            _ if raw.starts_with("list[") || raw.starts_with("List[") => ParamType::Array,
            _ => ParamType::String,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::String => "string",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub kind: ParamType,
    /// `None` means the parameter is required.
    pub default: Option<Value>,
}

impl Param {
    pub fn required(&self) -> bool {
        self.default.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSchema {
    pub params: Vec<Param>,
    /// Set by a `**kwargs` entry: unknown keywords are passed through.
    pub accepts_extra: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature must be wrapped in parentheses: {0}")]
    Unwrapped(String),
    #[error("empty parameter name in signature: {0}")]
    EmptyName(String),
    #[error("duplicate parameter '{0}'")]
    Duplicate(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindError {
    #[error("unexpected keyword argument '{0}'")]
    Unexpected(String),
    #[error("missing required argument '{0}'")]
    Missing(String),
}

impl ParamSchema {
    pub fn parse(signature: &str) -> Result<Self, SignatureError> {
        let trimmed = signature.trim();
        // a trailing return annotation is irrelevant to the argument schema
        let trimmed = match trimmed.rfind("->") {
            Some(i) if trimmed[..i].trim_end().ends_with(')') => trimmed[..i].trim_end(),
            _ => trimmed,
        };
        let inner = trimmed
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| SignatureError::Unwrapped(signature.to_string()))?;

        let mut schema = ParamSchema::default();
        for part in split_top_level(inner) {
            let part = part.trim();
            if part.is_empty() || part == "*" || part == "/" {
                continue;
            }
            if let Some(rest) = part.strip_prefix("**") {
                if rest.trim().is_empty() {
                    return Err(SignatureError::EmptyName(signature.to_string()));
                }
                schema.accepts_extra = true;
                continue;
            }
            if part.starts_with('*') {
                continue;
            }

            let (head, default) = match part.split_once('=') {
                Some((h, d)) => (h.trim(), Some(parse_default(d.trim()))),
                None => (part, None),
            };
            let (name, annotation) = match head.split_once(':') {
                Some((n, a)) => (n.trim(), Some(a.trim())),
                None => (head.trim(), None),
            };
            if name.is_empty() {
                return Err(SignatureError::EmptyName(signature.to_string()));
            }
            if name == "self" || name == "cls" {
                continue;
            }
            if schema.params.iter().any(|p| p.name == name) {
                return Err(SignatureError::Duplicate(name.to_string()));
            }
            schema.params.push(Param {
                name: name.to_string(),
                kind: ParamType::from_annotation(annotation),
                default,
            });
        }
        Ok(schema)
    }

    /// `{"type":"object","properties":{..},"required":[..]}`
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for p in &self.params {
            properties.insert(p.name.clone(), json!({ "type": p.kind.as_str() }));
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required())
            .map(|p| p.name.as_str())
            .collect();
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Binds keyword arguments the way a call with unpacked keywords would:
    /// unknown names and missing required names are errors, defaults fill
    /// the gaps.
    pub fn bind(&self, args: &Map<String, Value>) -> Result<Map<String, Value>, BindError> {
        if !self.accepts_extra
            && let Some(unknown) = args.keys().find(|k| !self.params.iter().any(|p| &p.name == *k))
        {
            return Err(BindError::Unexpected(unknown.clone()));
        }
        let mut bound = args.clone();
        for p in &self.params {
            if bound.contains_key(&p.name) {
                continue;
            }
            match &p.default {
                Some(d) => {
                    bound.insert(p.name.clone(), d.clone());
                }
                None => return Err(BindError::Missing(p.name.clone())),
            }
        }
        Ok(bound)
    }
}

/// Splits on commas that are not nested in brackets or quotes.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '(' | '[' | '{') => depth += 1,
            (None, ')' | ']' | '}') => depth -= 1,
            (None, ',') if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Defaults are written as JSON literals; the Python-style spellings
/// `None`/`True`/`False` and single-quoted strings are accepted too.
fn parse_default(raw: &str) -> Value {
    match raw {
        "None" => return Value::Null,
        "True" => return Value::Bool(true),
        "False" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        return v;
    }
    if let Some(inner) = raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')) {
        return Value::String(inner.to_string());
    }
    Value::String(raw.to_string())
}
