use anyhow::{Context, Result, anyhow};
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::llm::client_core::OpenAIClient;
use crate::llm::types::{ChatMessage, ChatRequest, LlmResponse};
use crate::llm::{LlmErrorKind, classify_error};

const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StreamChoiceDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: StreamChoiceDelta,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatStreamChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
}

/// One decoded line of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Delta(String),
    Done,
    /// Blank, malformed, or content-free line.
    Skip,
}

/// Decodes a single line: an optional `data:` marker followed by a JSON
/// delta, or the literal terminator.
pub fn parse_frame(line: &str) -> Frame {
    let line = line.trim();
    if line.is_empty() {
        return Frame::Skip;
    }
    let payload = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if payload == DONE_MARKER {
        return Frame::Done;
    }
    match serde_json::from_str::<ChatStreamChunk>(payload) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|c| !c.is_empty())
            .map(Frame::Delta)
            .unwrap_or(Frame::Skip),
        Err(e) => {
            debug!(payload, err=%e, "skipping malformed stream frame");
            Frame::Skip
        }
    }
}

/// Splits a byte stream into lines, keeping an unterminated tail until more
/// bytes arrive.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        let mut start = 0usize;
        for i in 0..self.buf.len() {
            if self.buf[i] == b'\n' {
                lines.push(String::from_utf8_lossy(&self.buf[start..i]).into_owned());
                start = i + 1;
            }
        }
        if start > 0 {
            self.buf.drain(0..start);
        }
        lines
    }

    /// Whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(rest)
    }
}

impl OpenAIClient {
    /// Streaming completion. Each non-empty delta is appended to the result
    /// and handed to `on_chunk` in arrival order before the next frame is read.
    pub async fn chat_stream<F>(&self, messages: &[ChatMessage], mut on_chunk: F) -> Result<LlmResponse>
    where
        F: FnMut(&str) + Send,
    {
        let url = self.endpoint();
        let req = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
        };
        let headers = self.headers()?;

        if let Ok(payload) = serde_json::to_string_pretty(&req) {
            debug!(payload=%payload, endpoint=%url, "sending chat.completions payload (stream)");
        }

        // Only establishing the stream is retried, never a partially read body.
        let max_attempts = self.llm_cfg.max_retries.saturating_add(1);
        let mut attempt = 1usize;
        let resp = loop {
            let res = self
                .inner
                .post(&url)
                .headers(headers.clone())
                .json(&req)
                .send()
                .await;
            match res {
                Err(e) => {
                    let err = anyhow::Error::new(e).context("send chat request (stream)");
                    let kind = classify_error(None, &err);
                    if OpenAIClient::should_retry(&kind) && attempt < max_attempts {
                        let wait = self.backoff_delay(attempt, None);
                        warn!(attempt, err=%err, wait_ms=%wait.as_millis(), "retrying stream establish after error");
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !status.is_success() {
                        let text = resp.text().await.unwrap_or_default();
                        let err = anyhow!("API error {}: {}", status.as_u16(), text);
                        let kind = classify_error(Some(status), &err);
                        if OpenAIClient::should_retry(&kind) && attempt < max_attempts {
                            let wait = self.backoff_delay(attempt, None);
                            info!(attempt, status=%status.as_u16(), wait_ms=%wait.as_millis(), "retrying stream establish after HTTP error");
                            tokio::time::sleep(wait).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(err);
                    }
                    break resp;
                }
            }
        };

        let mut byte_stream = resp.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut content = String::new();
        let mut deliver = |frame: Frame, content: &mut String| -> bool {
            match frame {
                Frame::Delta(delta) => {
                    content.push_str(&delta);
                    on_chunk(&delta);
                    false
                }
                Frame::Done => true,
                Frame::Skip => false,
            }
        };

        'read: while let Some(chunk) = byte_stream.next().await {
            let bytes = chunk
                .map_err(|e| anyhow::Error::new(e).context(LlmErrorKind::Network))
                .context("read chat stream")?;
            for line in lines.push(&bytes) {
                if deliver(parse_frame(&line), &mut content) {
                    break 'read;
                }
            }
        }
        if let Some(tail) = lines.finish() {
            deliver(parse_frame(&tail), &mut content);
        }

        debug!(chars = content.len(), "llm chat_stream finished");
        Ok(LlmResponse::from_content(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;
    use httptest::{Expectation, Server, matchers::*, responders::*};

    fn client_for(server: &Server) -> OpenAIClient {
        OpenAIClient::new(server.url_str(""), "k", "gpt-test")
            .unwrap()
            .with_llm_config(LlmConfig {
                max_retries: 0,
                ..LlmConfig::default()
            })
    }

    #[test]
    fn frame_with_and_without_marker() {
        assert_eq!(
            parse_frame(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#),
            Frame::Delta("Hi".into())
        );
        assert_eq!(
            parse_frame(r#"{"choices":[{"delta":{"content":"there"}}]}"#),
            Frame::Delta("there".into())
        );
        assert_eq!(parse_frame("data: [DONE]"), Frame::Done);
        assert_eq!(parse_frame("[DONE]"), Frame::Done);
    }

    #[test]
    fn malformed_and_empty_frames_are_skipped() {
        assert_eq!(parse_frame(""), Frame::Skip);
        assert_eq!(parse_frame("data: {not json"), Frame::Skip);
        assert_eq!(parse_frame(": keep-alive"), Frame::Skip);
        assert_eq!(
            parse_frame(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            Frame::Skip
        );
        assert_eq!(parse_frame(r#"data: {"choices":[]}"#), Frame::Skip);
    }

    #[test]
    fn line_buffer_reassembles_split_frames() {
        let mut lb = LineBuffer::new();
        assert!(lb.push(b"data: {\"choi").is_empty());
        let lines = lb.push(b"ces\":[]}\ndata: [DO");
        assert_eq!(lines, vec!["data: {\"choices\":[]}".to_string()]);
        assert!(lb.push(b"NE]").is_empty());
        assert_eq!(lb.finish().as_deref(), Some("data: [DONE]"));
        assert_eq!(lb.finish(), None);
    }

    #[tokio::test]
    async fn chunks_concatenate_to_content() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: garbage\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo \"}}]}\n\n",
            "{\"choices\":[{\"delta\":{\"content\":\"world\"}}]}\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n",
        );
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/v1/chat/completions"),
                request::body(json_decoded(eq(serde_json::json!({
                    "model": "gpt-test",
                    "messages": [{"role": "user", "content": "hi"}],
                    "stream": true
                })))),
            ])
            .respond_with(
                status_code(200)
                    .insert_header("content-type", "text/event-stream")
                    .body(body),
            ),
        );

        let mut chunks = Vec::new();
        let resp = client_for(&server)
            .chat_stream(&[ChatMessage::user("hi")], |c| chunks.push(c.to_string()))
            .await
            .unwrap();
        assert_eq!(chunks, vec!["Hel", "lo ", "world"]);
        assert_eq!(chunks.concat(), resp.content);
        assert_eq!(resp.content, "Hello world");
    }

    #[tokio::test]
    async fn stream_tool_calls_are_derived_from_full_text() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"```tool_call\\n{\\\"tool\\\":\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"\\\"list_partitions\\\"}\\n```\"}}]}\n",
            "data: [DONE]\n",
        );
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v1/chat/completions"))
                .respond_with(status_code(200).body(body)),
        );
        let resp = client_for(&server)
            .chat_stream(&[ChatMessage::user("hi")], |_| {})
            .await
            .unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "list_partitions");
    }

    #[tokio::test]
    async fn stream_non200_is_error() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/v1/chat/completions"))
                .respond_with(status_code(502).body("bad gateway")),
        );
        let mut called = false;
        let err = client_for(&server)
            .chat_stream(&[ChatMessage::user("hi")], |_| called = true)
            .await
            .unwrap_err();
        assert!(format!("{err}").contains("502"));
        assert!(!called);
    }
}
