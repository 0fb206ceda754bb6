use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::agent::events::{AgentEvent, EventSender, Notifier};
use crate::config::AgentConfig;
use crate::llm::{ChatMessage, ChatTransport, LlmResponse};
use crate::tools::ToolRegistry;

pub const DEFAULT_MAX_ITERATIONS: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    Completed {
        content: String,
        turns: usize,
        history: Vec<ChatMessage>,
    },
    Cancelled,
    Failed(String),
}

/// The user-role message that feeds a turn's tool outputs back to the model.
pub fn tool_results_message(results: &[(String, String)]) -> String {
    let blocks: Vec<String> = results
        .iter()
        .map(|(name, output)| format!("Tool: {name}\nResult:\n{output}"))
        .collect();
    format!(
        "Here are the tool results:\n\n{}\n\nPlease interpret these results for the user.",
        blocks.join("\n\n")
    )
}

/// Bounded request/extract/dispatch loop for one user request.
pub struct Orchestrator {
    transport: Arc<dyn ChatTransport>,
    tools: Arc<ToolRegistry>,
    max_iterations: usize,
    stream: bool,
}

impl Orchestrator {
    pub fn new(transport: Arc<dyn ChatTransport>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            transport,
            tools,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            stream: true,
        }
    }

    pub fn with_agent_config(mut self, cfg: &AgentConfig) -> Self {
        self.max_iterations = cfg.max_iterations.max(1);
        self.stream = cfg.stream;
        self
    }

    /// Drives `history` to a final answer. Emits `Finished` or `Error` itself;
    /// after `cancel` fires nothing more is emitted.
    pub async fn run(
        &self,
        history: Vec<ChatMessage>,
        tx: &EventSender,
        cancel: &CancellationToken,
    ) -> AgentOutcome {
        let span = info_span!("agent_run", request_id = %Uuid::now_v7());
        self.run_inner(history, Notifier::new(tx, cancel), cancel)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        mut history: Vec<ChatMessage>,
        notifier: Notifier<'_>,
        cancel: &CancellationToken,
    ) -> AgentOutcome {
        let mut last_content = String::new();
        let mut turns = 0usize;

        while turns < self.max_iterations {
            if cancel.is_cancelled() {
                debug!(turns, "cancelled before turn");
                return AgentOutcome::Cancelled;
            }
            turns += 1;
            debug!(turn = turns, messages = history.len(), "agent turn");

            let resp = match self.request_turn(&history, notifier).await {
                Ok(resp) => resp,
                Err(e) => {
                    if cancel.is_cancelled() {
                        return AgentOutcome::Cancelled;
                    }
                    let text = format!("{e:#}");
                    warn!(turn = turns, error = %text, "turn failed");
                    notifier.emit(AgentEvent::Error(text.clone()));
                    return AgentOutcome::Failed(text);
                }
            };
            if cancel.is_cancelled() {
                debug!(turn = turns, "cancelled after response");
                return AgentOutcome::Cancelled;
            }

            last_content = resp.content.clone();
            if resp.tool_calls.is_empty() {
                history.push(ChatMessage::assistant(resp.content));
                break;
            }

            history.push(ChatMessage::assistant(resp.content));
            let mut results = Vec::with_capacity(resp.tool_calls.len());
            for call in &resp.tool_calls {
                if cancel.is_cancelled() {
                    debug!(tool = %call.name, "cancelled between tool calls");
                    return AgentOutcome::Cancelled;
                }
                notifier.emit(AgentEvent::ToolCallStarted(call.name.clone()));
                let res = self.tools.execute_call(call).await;
                info!(tool = %res.tool_name, is_error = res.is_error, "tool executed");
                notifier.emit(AgentEvent::ToolResult {
                    name: res.tool_name.clone(),
                    output: res.output.clone(),
                });
                results.push((res.tool_name, res.output));
            }
            if cancel.is_cancelled() {
                return AgentOutcome::Cancelled;
            }
            history.push(ChatMessage::user(tool_results_message(&results)));

            if turns == self.max_iterations {
                info!(turns, "iteration cap reached, returning last turn content");
            }
        }

        // Completed only once the final answer actually reached the listener
        if !notifier.emit(AgentEvent::Finished(last_content.clone())) {
            debug!(turns, "cancelled before finishing");
            return AgentOutcome::Cancelled;
        }
        AgentOutcome::Completed {
            content: last_content,
            turns,
            history,
        }
    }

    /// One turn's complete text. Streaming failures fall back to a single
    /// non-streaming request. Only text not already streamed is emitted, so
    /// the chunks of a turn always add up to its content.
    async fn request_turn(
        &self,
        history: &[ChatMessage],
        notifier: Notifier<'_>,
    ) -> Result<LlmResponse> {
        let mut shown = String::new();
        let mut stream_err = None;
        if self.stream {
            let mut on_chunk = |c: &str| {
                shown.push_str(c);
                notifier.emit(AgentEvent::Chunk(c.to_string()));
            };
            let streamed = self.transport.chat_stream(history, &mut on_chunk).await;
            match streamed {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    warn!(
                        error = %format!("{e:#}"),
                        streamed_chars = shown.chars().count(),
                        "stream failed, retrying without streaming"
                    );
                    stream_err = Some(e);
                }
            }
        }

        let resp = self.transport.chat_once(history).await?;
        let Some(unseen) = resp.content.strip_prefix(shown.as_str()) else {
            let err = stream_err.unwrap_or_else(|| anyhow::anyhow!("stream interrupted"));
            return Err(err.context("stream interrupted after partial output"));
        };
        if !unseen.is_empty() {
            notifier.emit(AgentEvent::Chunk(unseen.to_string()));
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::{self, EventReceiver};
    use crate::llm::ChatTransport;
    use crate::tools::{FnHandler, ParamSchema, ToolDefinition};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::{Map, Value, json};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Replays canned turns. `repeat` answers every stream call once the
    /// script runs out.
    #[derive(Default)]
    struct ScriptedTransport {
        stream: Mutex<VecDeque<Result<Vec<String>, String>>>,
        once: Mutex<VecDeque<Result<String, String>>>,
        repeat: Option<String>,
        stream_calls: AtomicUsize,
        once_calls: AtomicUsize,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedTransport {
        fn streams(turns: Vec<Result<Vec<&str>, &str>>) -> Self {
            let stream = turns
                .into_iter()
                .map(|t| {
                    t.map(|chunks| chunks.into_iter().map(String::from).collect())
                        .map_err(String::from)
                })
                .collect();
            Self {
                stream: Mutex::new(stream),
                ..Self::default()
            }
        }

        fn repeating(content: &str) -> Self {
            Self {
                repeat: Some(content.to_string()),
                ..Self::default()
            }
        }

        fn with_once(self, replies: Vec<Result<&str, &str>>) -> Self {
            *self.once.lock().unwrap() = replies
                .into_iter()
                .map(|r| r.map(String::from).map_err(String::from))
                .collect();
            self
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn chat_once(&self, messages: &[ChatMessage]) -> Result<LlmResponse> {
            self.once_calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(messages.to_vec());
            match self.once.lock().unwrap().pop_front() {
                Some(Ok(content)) => Ok(LlmResponse::from_content(content)),
                Some(Err(e)) => Err(anyhow!(e)),
                None => Err(anyhow!("no scripted reply")),
            }
        }

        async fn chat_stream(
            &self,
            messages: &[ChatMessage],
            on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
        ) -> Result<LlmResponse> {
            self.stream_calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(messages.to_vec());
            let next = self.stream.lock().unwrap().pop_front();
            let chunks = match next {
                Some(Ok(chunks)) => chunks,
                Some(Err(e)) => return Err(anyhow!(e)),
                None => match &self.repeat {
                    Some(r) => vec![r.clone()],
                    None => return Err(anyhow!("no scripted stream")),
                },
            };
            for c in &chunks {
                on_chunk(c);
            }
            Ok(LlmResponse::from_content(chunks.concat()))
        }
    }

    fn tool(name: &str, f: impl Fn(&Map<String, Value>) -> Result<Value> + Send + Sync + 'static) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: String::new(),
            source: "test".into(),
            schema: ParamSchema::parse("(**kwargs)").unwrap(),
            handler: Arc::new(FnHandler(f)),
        }
    }

    fn registry(defs: Vec<ToolDefinition>) -> Arc<ToolRegistry> {
        let mut reg = ToolRegistry::new();
        for d in defs {
            reg.insert(d);
        }
        Arc::new(reg)
    }

    fn drain(rx: &mut EventReceiver) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn chunks(events: &[AgentEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Chunk(c) => Some(c.as_str()),
                _ => None,
            })
            .collect()
    }

    const CALL_QUOTA: &str = "Checking.\n```tool_call\n{\"tool\":\"get_quota\",\"arguments\":{}}\n```";

    #[tokio::test]
    async fn plain_answer_finishes_after_one_turn() {
        let transport = Arc::new(ScriptedTransport::streams(vec![Ok(vec!["Hello", ", ", "world"])]));
        let orch = Orchestrator::new(transport.clone(), registry(vec![]));
        let (tx, mut rx) = events::channel();
        let cancel = CancellationToken::new();

        let outcome = orch.run(vec![ChatMessage::user("hi")], &tx, &cancel).await;
        let events = drain(&mut rx);

        match outcome {
            AgentOutcome::Completed { content, turns, history } => {
                assert_eq!(content, "Hello, world");
                assert_eq!(turns, 1);
                assert_eq!(history.last(), Some(&ChatMessage::assistant("Hello, world")));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(transport.stream_calls.load(Ordering::SeqCst), 1);
        assert_eq!(events.last(), Some(&AgentEvent::Finished("Hello, world".into())));
        assert_eq!(chunks(&events), "Hello, world");
        assert_eq!(events.iter().filter(|e| matches!(e, AgentEvent::Finished(_))).count(), 1);
    }

    #[tokio::test]
    async fn tool_turn_then_answer() {
        let transport = Arc::new(ScriptedTransport::streams(vec![
            Ok(vec![CALL_QUOTA]),
            Ok(vec!["You have 10 GB left."]),
        ]));
        let reg = registry(vec![tool("get_quota", |_| Ok(json!({"free_gb": 10})))]);
        let orch = Orchestrator::new(transport.clone(), reg);
        let (tx, mut rx) = events::channel();
        let cancel = CancellationToken::new();

        let outcome = orch.run(vec![ChatMessage::user("quota?")], &tx, &cancel).await;
        let events = drain(&mut rx);

        let expected_results = "Here are the tool results:\n\nTool: get_quota\nResult:\n{\"free_gb\":10}\n\nPlease interpret these results for the user.";
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen[1],
            vec![
                ChatMessage::user("quota?"),
                ChatMessage::assistant(CALL_QUOTA),
                ChatMessage::user(expected_results),
            ]
        );

        assert_eq!(
            events,
            vec![
                AgentEvent::Chunk(CALL_QUOTA.into()),
                AgentEvent::ToolCallStarted("get_quota".into()),
                AgentEvent::ToolResult {
                    name: "get_quota".into(),
                    output: "{\"free_gb\":10}".into()
                },
                AgentEvent::Chunk("You have 10 GB left.".into()),
                AgentEvent::Finished("You have 10 GB left.".into()),
            ]
        );
        assert!(matches!(outcome, AgentOutcome::Completed { turns: 2, .. }));
    }

    #[tokio::test]
    async fn multiple_results_are_joined_in_order() {
        let text = "{\"tool\": \"a\"} and {\"tool\": \"nope\"}";
        let transport = Arc::new(ScriptedTransport::streams(vec![Ok(vec![text]), Ok(vec!["done"])]));
        let reg = registry(vec![tool("a", |_| Ok(Value::String("A-out".into())))]);
        let orch = Orchestrator::new(transport.clone(), reg);
        let (tx, _rx) = events::channel();
        orch.run(vec![ChatMessage::user("go")], &tx, &CancellationToken::new()).await;

        let seen = transport.seen.lock().unwrap();
        let results = &seen[1].last().unwrap().content;
        assert_eq!(
            results,
            &tool_results_message(&[
                ("a".into(), "A-out".into()),
                ("nope".into(), "{\"error\":\"Unknown tool: nope\"}".into()),
            ])
        );
        assert!(results.starts_with("Here are the tool results:\n\nTool: a\nResult:\nA-out\n\nTool: nope\nResult:\n"));
    }

    #[tokio::test]
    async fn runaway_tool_calls_stop_at_cap() {
        let transport = Arc::new(ScriptedTransport::repeating(CALL_QUOTA));
        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = invocations.clone();
        let reg = registry(vec![tool("get_quota", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!({}))
        })]);
        let orch = Orchestrator::new(transport.clone(), reg);
        let (tx, mut rx) = events::channel();

        let outcome = orch.run(vec![ChatMessage::user("loop")], &tx, &CancellationToken::new()).await;
        let events = drain(&mut rx);

        assert_eq!(transport.stream_calls.load(Ordering::SeqCst), DEFAULT_MAX_ITERATIONS);
        assert_eq!(invocations.load(Ordering::SeqCst), DEFAULT_MAX_ITERATIONS);
        match outcome {
            AgentOutcome::Completed { content, turns, .. } => {
                assert_eq!(turns, 5);
                assert_eq!(content, CALL_QUOTA);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(events.last(), Some(&AgentEvent::Finished(CALL_QUOTA.into())));
        assert!(!events.iter().any(|e| matches!(e, AgentEvent::Error(_))));
    }

    #[tokio::test]
    async fn configured_cap_is_respected() {
        let transport = Arc::new(ScriptedTransport::repeating(CALL_QUOTA));
        let orch = Orchestrator::new(transport.clone(), registry(vec![])).with_agent_config(&AgentConfig {
            max_iterations: 2,
            stream: true,
        });
        let (tx, _rx) = events::channel();
        orch.run(vec![ChatMessage::user("x")], &tx, &CancellationToken::new()).await;
        assert_eq!(transport.stream_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancel_between_tool_calls() {
        let text = "{\"tool\": \"first\"}\n{\"tool\": \"second\"}";
        let transport = Arc::new(ScriptedTransport::streams(vec![Ok(vec![text]), Ok(vec!["never"])]));
        let cancel = CancellationToken::new();
        let second_ran = Arc::new(AtomicBool::new(false));

        let token = cancel.clone();
        let flag = second_ran.clone();
        let reg = registry(vec![
            tool("first", move |_| {
                token.cancel();
                Ok(Value::String("one".into()))
            }),
            tool("second", move |_| {
                flag.store(true, Ordering::SeqCst);
                Ok(Value::String("two".into()))
            }),
        ]);
        let orch = Orchestrator::new(transport.clone(), reg);
        let (tx, mut rx) = events::channel();

        let outcome = orch.run(vec![ChatMessage::user("go")], &tx, &cancel).await;
        let events = drain(&mut rx);

        assert_eq!(outcome, AgentOutcome::Cancelled);
        assert!(!second_ran.load(Ordering::SeqCst));
        assert_eq!(
            events,
            vec![
                AgentEvent::Chunk(text.into()),
                AgentEvent::ToolCallStarted("first".into()),
            ]
        );
        assert_eq!(transport.stream_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_emits_nothing() {
        let transport = Arc::new(ScriptedTransport::streams(vec![Ok(vec!["hi"])]));
        let orch = Orchestrator::new(transport.clone(), registry(vec![]));
        let (tx, mut rx) = events::channel();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(orch.run(vec![], &tx, &cancel).await, AgentOutcome::Cancelled);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(transport.stream_calls.load(Ordering::SeqCst), 0);
    }

    struct CancelMidStream(CancellationToken);

    #[async_trait]
    impl ChatTransport for CancelMidStream {
        async fn chat_once(&self, _: &[ChatMessage]) -> Result<LlmResponse> {
            Err(anyhow!("unused"))
        }

        async fn chat_stream(
            &self,
            _: &[ChatMessage],
            on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
        ) -> Result<LlmResponse> {
            on_chunk("visible");
            self.0.cancel();
            on_chunk("hidden");
            Ok(LlmResponse::from_content("visiblehidden".into()))
        }
    }

    #[tokio::test]
    async fn chunks_after_cancel_are_dropped() {
        let cancel = CancellationToken::new();
        let orch = Orchestrator::new(Arc::new(CancelMidStream(cancel.clone())), registry(vec![]));
        let (tx, mut rx) = events::channel();

        assert_eq!(orch.run(vec![], &tx, &cancel).await, AgentOutcome::Cancelled);
        assert_eq!(drain(&mut rx), vec![AgentEvent::Chunk("visible".into())]);
    }

    #[tokio::test]
    async fn stream_failure_falls_back_to_single_request() {
        let transport = Arc::new(
            ScriptedTransport::streams(vec![Err("connection reset")]).with_once(vec![Ok("Fallback answer")]),
        );
        let orch = Orchestrator::new(transport.clone(), registry(vec![]));
        let (tx, mut rx) = events::channel();

        let outcome = orch.run(vec![ChatMessage::user("hi")], &tx, &CancellationToken::new()).await;
        assert!(matches!(outcome, AgentOutcome::Completed { .. }));
        assert_eq!(transport.once_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            drain(&mut rx),
            vec![
                AgentEvent::Chunk("Fallback answer".into()),
                AgentEvent::Finished("Fallback answer".into()),
            ]
        );
    }

    /// Streams `sent`, then fails; the single request answers `full`.
    struct BrokenStream {
        sent: &'static str,
        full: &'static str,
    }

    #[async_trait]
    impl ChatTransport for BrokenStream {
        async fn chat_once(&self, _: &[ChatMessage]) -> Result<LlmResponse> {
            Ok(LlmResponse::from_content(self.full.into()))
        }

        async fn chat_stream(
            &self,
            _: &[ChatMessage],
            on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
        ) -> Result<LlmResponse> {
            on_chunk(self.sent);
            Err(anyhow!("body read failed"))
        }
    }

    #[tokio::test]
    async fn partial_stream_is_not_repeated_by_fallback() {
        let orch = Orchestrator::new(
            Arc::new(BrokenStream {
                sent: "Hel",
                full: "Hello world",
            }),
            registry(vec![]),
        );
        let (tx, mut rx) = events::channel();

        let outcome = orch.run(vec![ChatMessage::user("hi")], &tx, &CancellationToken::new()).await;
        let events = drain(&mut rx);
        assert!(matches!(outcome, AgentOutcome::Completed { ref content, .. } if content == "Hello world"));
        assert_eq!(chunks(&events), "Hello world");
        assert_eq!(
            events,
            vec![
                AgentEvent::Chunk("Hel".into()),
                AgentEvent::Chunk("lo world".into()),
                AgentEvent::Finished("Hello world".into()),
            ]
        );
    }

    #[tokio::test]
    async fn diverging_fallback_after_partial_stream_fails_turn() {
        let orch = Orchestrator::new(
            Arc::new(BrokenStream {
                sent: "Hel",
                full: "Something else",
            }),
            registry(vec![]),
        );
        let (tx, mut rx) = events::channel();

        let outcome = orch.run(vec![ChatMessage::user("hi")], &tx, &CancellationToken::new()).await;
        let expected = "stream interrupted after partial output: body read failed".to_string();
        assert_eq!(outcome, AgentOutcome::Failed(expected.clone()));
        assert_eq!(
            drain(&mut rx),
            vec![AgentEvent::Chunk("Hel".into()), AgentEvent::Error(expected)]
        );
    }

    #[tokio::test]
    async fn transport_failure_is_reported_once() {
        let transport = Arc::new(
            ScriptedTransport::streams(vec![Err("stream down")]).with_once(vec![Err("API error 503: busy")]),
        );
        let orch = Orchestrator::new(transport, registry(vec![]));
        let (tx, mut rx) = events::channel();

        let outcome = orch.run(vec![ChatMessage::user("hi")], &tx, &CancellationToken::new()).await;
        assert_eq!(outcome, AgentOutcome::Failed("API error 503: busy".into()));
        assert_eq!(drain(&mut rx), vec![AgentEvent::Error("API error 503: busy".into())]);
    }

    #[tokio::test]
    async fn streaming_disabled_uses_single_request() {
        let transport = Arc::new(ScriptedTransport::default().with_once(vec![Ok("direct")]));
        let orch = Orchestrator::new(transport.clone(), registry(vec![])).with_agent_config(&AgentConfig {
            max_iterations: 5,
            stream: false,
        });
        let (tx, mut rx) = events::channel();

        orch.run(vec![ChatMessage::user("hi")], &tx, &CancellationToken::new()).await;
        assert_eq!(transport.stream_calls.load(Ordering::SeqCst), 0);
        assert_eq!(chunks(&drain(&mut rx)), "direct");
    }
}
