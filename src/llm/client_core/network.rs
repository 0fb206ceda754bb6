use anyhow::{Context, Result, anyhow};
use reqwest::header::RETRY_AFTER;
use tracing::{debug, error, info, warn};

use super::OpenAIClient;
use crate::llm::types::{ChatMessage, ChatRequest, ChatResponse, LlmResponse};
use crate::llm::{LlmErrorKind, classify_error};

pub async fn chat_once(client: &OpenAIClient, messages: &[ChatMessage]) -> Result<LlmResponse> {
    let url = client.endpoint();
    let req = ChatRequest {
        model: &client.model,
        messages,
        stream: false,
    };
    let headers = client.headers()?;

    if let Ok(payload) = serde_json::to_string_pretty(&req) {
        debug!(payload=%payload, endpoint=%url, "sending chat.completions payload");
    }

    let max_attempts = client.llm_cfg.max_retries.saturating_add(1);
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 1..=max_attempts {
        let resp_res = client
            .inner
            .post(&url)
            .headers(headers.clone())
            .json(&req)
            .send()
            .await;

        let resp = match resp_res {
            Ok(resp) => resp,
            Err(e) => {
                error!(attempt, err=%e, "llm chat_once send error");
                let err = anyhow::Error::new(e).context("send chat request");
                let kind = classify_error(None, &err);
                last_err = Some(err);
                if OpenAIClient::should_retry(&kind) && attempt < max_attempts {
                    let wait = client.backoff_delay(attempt, None);
                    info!(attempt, kind=?kind, wait_ms=%wait.as_millis(), "retrying chat_once");
                    tokio::time::sleep(wait).await;
                    continue;
                }
                break;
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            let text = resp.text().await.unwrap_or_default();
            error!(attempt, status=%status.as_u16(), body=%text, "llm chat_once non-success status");
            let e = anyhow!("API error {}: {}", status.as_u16(), text);
            let kind = classify_error(Some(status), &e);
            if OpenAIClient::should_retry(&kind) && attempt < max_attempts {
                let wait = client.backoff_delay(attempt, retry_after);
                info!(attempt, kind=?kind, wait_ms=%wait.as_millis(), "retrying chat_once");
                tokio::time::sleep(wait).await;
                last_err = Some(e);
                continue;
            }
            return Err(e);
        }

        let response_text = resp.text().await.context("read chat response body")?;
        debug!(response_body=%response_text, "llm chat_once response");

        let body: ChatResponse = match serde_json::from_str(&response_text) {
            Ok(body) => body,
            Err(e) => {
                warn!(attempt, err=%e, "llm chat_once deserialize error");
                return Err(anyhow::Error::new(e)
                    .context(LlmErrorKind::Deserialize)
                    .context("parse chat response"));
            }
        };

        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .context("no choices returned")?;
        return Ok(LlmResponse::from_content(content));
    }

    Err(last_err.unwrap_or_else(|| anyhow!(LlmErrorKind::Unknown)))
}
