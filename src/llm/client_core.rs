use anyhow::{Context, Result};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use std::time::Duration;

use crate::config::LlmConfig;
use crate::llm::LlmErrorKind;
use crate::llm::types::{ChatMessage, LlmResponse};

mod network;

#[derive(Debug, Clone)]
pub struct OpenAIClient {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub(crate) inner: reqwest::Client,
    pub llm_cfg: LlmConfig,
}

impl OpenAIClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let inner = reqwest::Client::builder()
            .build()
            .context("build http client")?;
        Ok(Self {
            base_url: normalize_base_url(&base_url.into()),
            api_key: api_key.into(),
            model: model.into(),
            inner,
            llm_cfg: LlmConfig::default(),
        })
    }

    pub fn with_llm_config(mut self, cfg: LlmConfig) -> Self {
        // Rebuild the reqwest client so the timeouts apply to every request.
        let builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms));
        match builder.build() {
            Ok(c) => self.inner = c,
            Err(e) => tracing::warn!(error = %e, "keeping default http client"),
        }
        self.llm_cfg = cfg;
        self
    }

    fn api_root(&self) -> String {
        let mut base = self.base_url.trim_end_matches('/').to_string();
        if let Some(stripped) = base.strip_suffix("/v1") {
            base = stripped.trim_end_matches('/').to_string();
        }
        base
    }

    pub(crate) fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.api_root())
    }

    pub(crate) fn models_endpoint(&self) -> String {
        format!("{}/v1/models", self.api_root())
    }

    pub(crate) fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .context("api key is not a valid header value")?;
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }

    /// Non-streaming completion. Any non-success status is an error.
    pub async fn chat_once(&self, messages: &[ChatMessage]) -> Result<LlmResponse> {
        network::chat_once(self, messages).await
    }

    pub(crate) fn should_retry(kind: &LlmErrorKind) -> bool {
        matches!(
            kind,
            LlmErrorKind::RateLimited
                | LlmErrorKind::Server
                | LlmErrorKind::Network
                | LlmErrorKind::Timeout
        )
    }

    pub(crate) fn backoff_delay(&self, attempt: usize, retry_after_secs: Option<u64>) -> Duration {
        if self.llm_cfg.respect_retry_after
            && let Some(secs) = retry_after_secs
        {
            return Duration::from_secs(secs);
        }
        let base = self.llm_cfg.retry_base_ms;
        let exp = base.saturating_mul(1u64 << (attempt.saturating_sub(1).min(16) as u32));
        let jitter = self.llm_cfg.retry_jitter_ms as i64;
        let half = jitter / 2;
        let rnd = fastrand::i64(-half..=half).max(0) as u64;
        Duration::from_millis(exp.saturating_add(rnd))
    }
}

/// Adds `https://` when the configured host has no scheme.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}
