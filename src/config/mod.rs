use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::cli::Cli;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_FALLBACK_MODEL: &str = "llama-4-scout";
pub const PROJECT_DIR: &str = ".toolchat";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_url: String,
    pub model: String,
    pub fallback_model: String,
    pub api_key: Option<String>,
    pub project_root: PathBuf,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub tools: ToolsConfig,
    pub tool_sources: Vec<ToolSourceConfig>,
    pub tool_sources_file: Option<PathBuf>,
    pub prompt_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_FALLBACK_MODEL.to_string(),
            fallback_model: DEFAULT_FALLBACK_MODEL.to_string(),
            api_key: None,
            project_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            llm: LlmConfig::default(),
            agent: AgentConfig::default(),
            tools: ToolsConfig::default(),
            tool_sources: vec![],
            tool_sources_file: None,
            prompt_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Establishment retries; the agent loop already falls back to a
    /// non-streaming request once.
    pub max_retries: usize,
    pub retry_base_ms: u64,
    pub retry_jitter_ms: u64,
    pub respect_retry_after: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            request_timeout_ms: 120_000,
            max_retries: 0,
            retry_base_ms: 1000,
            retry_jitter_ms: 500,
            respect_retry_after: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub max_iterations: usize,
    pub stream: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            stream: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolsConfig {
    pub timeout_ms: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

/// One loadable tool source: a display name, a description and the manifest
/// path.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ToolSourceConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FileConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub fallback_model: Option<String>,
    pub api_key: Option<String>,
    pub llm: Option<PartialLlmConfig>,
    pub agent: Option<PartialAgentConfig>,
    pub tools: Option<PartialToolsConfig>,
    pub tool_sources: Option<Vec<ToolSourceConfig>>,
    pub tool_sources_file: Option<PathBuf>,
    pub prompt_file: Option<PathBuf>,
}

impl FileConfig {
    /// Anchors relative tool source, tool sources file and prompt file paths
    /// at `base`. Absolute paths are left alone.
    pub fn relative_to(mut self, base: &Path) -> Self {
        if let Some(list) = self.tool_sources.as_mut() {
            for s in list {
                s.path = base.join(&s.path);
            }
        }
        self.tool_sources_file = self.tool_sources_file.map(|p| base.join(p));
        self.prompt_file = self.prompt_file.map(|p| base.join(p));
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialLlmConfig {
    pub connect_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_base_ms: Option<u64>,
    pub retry_jitter_ms: Option<u64>,
    pub respect_retry_after: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialAgentConfig {
    pub max_iterations: Option<usize>,
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialToolsConfig {
    pub timeout_ms: Option<u64>,
}

/// `{"mcps": [{name, description, path}, ...]}`
#[derive(Debug, Clone, Default, Deserialize)]
struct ToolSourcesFile {
    #[serde(default)]
    mcps: Vec<ToolSourceConfig>,
}

impl AppConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let cwd = std::env::current_dir().context("resolve current dir")?;
        let project_cfg = load_project_config(&cwd).unwrap_or_default();
        let file_cfg = load_file_config().unwrap_or_default();
        Self::merge(cli, &cwd, project_cfg, file_cfg, |k| std::env::var(k).ok())
    }

    /// Resolves every field by precedence: CLI, environment, project file,
    /// global file, defaults. Relative paths from the project file resolve
    /// against `project_root`; `file_cfg` paths are expected to be anchored
    /// already (see [`read_file_config`]).
    pub fn merge(
        cli: &Cli,
        project_root: &Path,
        project_cfg: FileConfig,
        file_cfg: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let project_cfg = project_cfg.relative_to(project_root);
        let api_key = cli
            .api_key
            .clone()
            .or_else(|| env("TOOLCHAT_API_KEY"))
            .or_else(|| env("OPENAI_API_KEY"))
            .or(project_cfg.api_key)
            .or(file_cfg.api_key)
            .filter(|k| !k.is_empty());
        let base_url = cli
            .base_url
            .clone()
            .or_else(|| env("TOOLCHAT_BASE_URL"))
            .or(project_cfg.base_url)
            .or(file_cfg.base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let fallback_model = project_cfg
            .fallback_model
            .or(file_cfg.fallback_model)
            .unwrap_or_else(|| DEFAULT_FALLBACK_MODEL.to_string());
        let model = match cli
            .model
            .clone()
            .or_else(|| env("TOOLCHAT_MODEL"))
            .or(project_cfg.model)
            .or(file_cfg.model)
            .filter(|m| !m.is_empty())
        {
            Some(m) => m,
            None => {
                warn!(fallback=%fallback_model, "no model configured, using fallback model");
                fallback_model.clone()
            }
        };

        let llm = {
            let d = LlmConfig::default();
            let p = project_cfg.llm.unwrap_or_default();
            let f = file_cfg.llm.unwrap_or_default();
            LlmConfig {
                connect_timeout_ms: p
                    .connect_timeout_ms
                    .or(f.connect_timeout_ms)
                    .unwrap_or(d.connect_timeout_ms),
                request_timeout_ms: p
                    .request_timeout_ms
                    .or(f.request_timeout_ms)
                    .unwrap_or(d.request_timeout_ms),
                max_retries: p.max_retries.or(f.max_retries).unwrap_or(d.max_retries),
                retry_base_ms: p.retry_base_ms.or(f.retry_base_ms).unwrap_or(d.retry_base_ms),
                retry_jitter_ms: p
                    .retry_jitter_ms
                    .or(f.retry_jitter_ms)
                    .unwrap_or(d.retry_jitter_ms),
                respect_retry_after: p
                    .respect_retry_after
                    .or(f.respect_retry_after)
                    .unwrap_or(d.respect_retry_after),
            }
        };

        let agent = {
            let d = AgentConfig::default();
            let p = project_cfg.agent.unwrap_or_default();
            let f = file_cfg.agent.unwrap_or_default();
            AgentConfig {
                max_iterations: cli
                    .max_iterations
                    .or(p.max_iterations)
                    .or(f.max_iterations)
                    .unwrap_or(d.max_iterations)
                    .max(1),
                stream: !cli.no_stream && p.stream.or(f.stream).unwrap_or(d.stream),
            }
        };

        let tools = ToolsConfig {
            timeout_ms: project_cfg
                .tools
                .and_then(|t| t.timeout_ms)
                .or(file_cfg.tools.and_then(|t| t.timeout_ms))
                .unwrap_or(ToolsConfig::default().timeout_ms),
        };

        let tool_sources_file = cli
            .tools_file
            .clone()
            .or(project_cfg.tool_sources_file)
            .or(file_cfg.tool_sources_file);
        let tool_sources = project_cfg
            .tool_sources
            .or(file_cfg.tool_sources)
            .unwrap_or_default();
        let prompt_file = cli
            .prompt_file
            .clone()
            .or(project_cfg.prompt_file)
            .or(file_cfg.prompt_file);

        Ok(Self {
            base_url,
            model,
            fallback_model,
            api_key,
            project_root: project_root.to_path_buf(),
            llm,
            agent,
            tools,
            tool_sources,
            tool_sources_file,
            prompt_file,
        })
    }

    /// Inline `tool_sources` followed by the entries of `tool_sources_file`.
    pub fn resolved_tool_sources(&self) -> Vec<ToolSourceConfig> {
        let mut out = self.tool_sources.clone();
        if let Some(path) = &self.tool_sources_file {
            match load_tool_sources_file(path) {
                Ok(list) => out.extend(list),
                Err(e) => warn!(path=%path.display(), error=%format!("{e:#}"), "tool sources file ignored"),
            }
        }
        out
    }
}

pub fn load_file_config() -> Result<FileConfig> {
    use std::env;

    fn candidate_paths() -> Vec<PathBuf> {
        let mut v = Vec::new();
        if let Ok(p) = env::var("TOOLCHAT_CONFIG") {
            v.push(PathBuf::from(p));
        }
        if let Ok(xdg_home) = env::var("XDG_CONFIG_HOME") {
            v.push(Path::new(&xdg_home).join("toolchat/config.toml"));
        } else if let Some(home) = dirs::home_dir() {
            v.push(home.join(".config/toolchat/config.toml"));
        }
        v
    }

    for p in candidate_paths() {
        if p.exists() {
            match read_file_config(&p) {
                Ok(cfg) => {
                    info!(path=%p.display(), "loaded config file");
                    return Ok(cfg);
                }
                Err(e) => {
                    warn!(path=%p.display(), error=%format!("{e:#}"), "parse config failed");
                    continue;
                }
            }
        }
    }
    Ok(FileConfig::default())
}

/// Parses a global config file. Relative paths inside it resolve against the
/// file's own directory.
pub fn read_file_config(path: &Path) -> Result<FileConfig> {
    let s = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: FileConfig = toml::from_str(&s)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    Ok(cfg.relative_to(path.parent().unwrap_or_else(|| Path::new("."))))
}

/// Load project-specific configuration from .toolchat/config.toml
pub fn load_project_config(project_root: &Path) -> Result<FileConfig> {
    let project_config_path = project_root.join(PROJECT_DIR).join("config.toml");

    if !project_config_path.exists() {
        return Ok(FileConfig::default());
    }
    let s = fs::read_to_string(&project_config_path).with_context(|| {
        format!(
            "read project config file: {}",
            project_config_path.display()
        )
    })?;
    match toml::from_str::<FileConfig>(&s) {
        Ok(cfg) => {
            info!(path=%project_config_path.display(), "loaded project config file");
            Ok(cfg)
        }
        Err(e) => {
            warn!(path=%project_config_path.display(), error=%e.to_string(), "parse project config failed");
            Ok(FileConfig::default())
        }
    }
}

/// Reads a `{"mcps": [...]}` descriptor list. Relative `path`s resolve
/// against the list file's directory.
pub fn load_tool_sources_file(path: &Path) -> Result<Vec<ToolSourceConfig>> {
    let s = fs::read_to_string(path)
        .with_context(|| format!("read tool sources file: {}", path.display()))?;
    let parsed: ToolSourcesFile = serde_json::from_str(&s)
        .with_context(|| format!("parse tool sources file: {}", path.display()))?;
    let base = path.parent().unwrap_or(Path::new("."));
    Ok(parsed
        .mcps
        .into_iter()
        .map(|mut src| {
            if src.path.is_relative() {
                src.path = base.join(&src.path);
            }
            src
        })
        .collect())
}
