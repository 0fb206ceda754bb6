use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::agent::events::{self, AgentEvent, EventReceiver};
use crate::agent::orchestrator::{AgentOutcome, Orchestrator};
use crate::config::AgentConfig;
use crate::llm::{ChatMessage, ChatTransport};
use crate::tools::SharedRegistry;

pub const JOIN_TIMEOUT: Duration = Duration::from_secs(3);

struct ActiveRequest {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// One conversation: its history, system prompt and at most one running
/// request.
pub struct ChatSession {
    transport: Arc<dyn ChatTransport>,
    tools: Arc<SharedRegistry>,
    agent: AgentConfig,
    system_prompt: String,
    history: Arc<Mutex<Vec<ChatMessage>>>,
    active: Option<ActiveRequest>,
}

fn lock(history: &Mutex<Vec<ChatMessage>>) -> MutexGuard<'_, Vec<ChatMessage>> {
    history.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ChatSession {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        tools: Arc<SharedRegistry>,
        agent: AgentConfig,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            tools,
            agent,
            system_prompt: system_prompt.into(),
            history: Arc::new(Mutex::new(Vec::new())),
            active: None,
        }
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        lock(&self.history).clone()
    }

    pub fn is_busy(&self) -> bool {
        self.active.as_ref().is_some_and(|a| !a.handle.is_finished())
    }

    /// Starts a request for `text`, first stopping any request still running.
    /// Events arrive on the returned receiver, which closes once the request
    /// is over and the history is updated.
    pub async fn submit(&mut self, text: impl Into<String>) -> EventReceiver {
        self.stop_active().await;

        let text = text.into();
        let messages = {
            let mut h = lock(&self.history);
            h.push(ChatMessage::user(text));
            let mut m = Vec::with_capacity(h.len() + 1);
            if !self.system_prompt.is_empty() {
                m.push(ChatMessage::system(self.system_prompt.clone()));
            }
            m.extend(h.iter().cloned());
            m
        };

        let (tx, rx) = events::channel();
        let cancel = CancellationToken::new();
        let orchestrator = Orchestrator::new(self.transport.clone(), self.tools.snapshot())
            .with_agent_config(&self.agent);
        let history = self.history.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let run = AssertUnwindSafe(orchestrator.run(messages, &tx, &token)).catch_unwind();
            match run.await {
                // Completed means `Finished` was delivered, so the answer is
                // kept even if a later submit cancels the token first
                Ok(AgentOutcome::Completed {
                    content,
                    turns,
                    history: transcript,
                }) => {
                    debug!(turns, transcript = transcript.len(), "request completed");
                    lock(&history).push(ChatMessage::assistant(content));
                }
                Ok(AgentOutcome::Cancelled) => debug!("request cancelled"),
                Ok(AgentOutcome::Failed(e)) => debug!(error = %e, "request failed"),
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(panic = %msg, "agent worker panicked");
                    if !token.is_cancelled() {
                        let _ = tx.send(AgentEvent::Error(format!("worker panicked: {msg}")));
                    }
                }
            }
        });

        self.active = Some(ActiveRequest { cancel, handle });
        rx
    }

    /// Requests cancellation of the running request without waiting for it.
    pub fn cancel(&self) {
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }
    }

    /// Waits for the running request to finish on its own.
    pub async fn wait(&mut self) {
        if let Some(active) = self.active.take()
            && let Err(e) = active.handle.await
        {
            warn!(error = %e, "agent worker join failed");
        }
    }

    /// Stops the running request and forgets the conversation.
    pub async fn clear(&mut self) {
        self.stop_active().await;
        lock(&self.history).clear();
    }

    /// Cancels the active request and joins it for at most [`JOIN_TIMEOUT`];
    /// a worker that does not stop in time is detached.
    async fn stop_active(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        active.cancel.cancel();
        match tokio::time::timeout(JOIN_TIMEOUT, &mut active.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "previous agent worker ended abnormally"),
            Err(_) => warn!(
                timeout_ms = JOIN_TIMEOUT.as_millis() as u64,
                "previous agent worker did not stop in time; detaching"
            ),
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.cancel();
    }
}
