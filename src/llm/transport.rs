use anyhow::Result;
use async_trait::async_trait;

use crate::llm::client_core::OpenAIClient;
use crate::llm::types::{ChatMessage, LlmResponse};

/// The completion calls the agent loop depends on.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn chat_once(&self, messages: &[ChatMessage]) -> Result<LlmResponse>;

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
    ) -> Result<LlmResponse>;
}

#[async_trait]
impl ChatTransport for OpenAIClient {
    async fn chat_once(&self, messages: &[ChatMessage]) -> Result<LlmResponse> {
        OpenAIClient::chat_once(self, messages).await
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
    ) -> Result<LlmResponse> {
        OpenAIClient::chat_stream(self, messages, |c| on_chunk(c)).await
    }
}
