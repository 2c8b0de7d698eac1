//! The tool-use loop that drives one conversation turn.
//!
//! A turn appends the user message, opens a model stream over the current
//! transcript and, while the model keeps asking for tools, dispatches the
//! requested calls and re-opens the stream with their results appended.
//! Tool failures never end a turn: they are written into the transcript as
//! error payloads so the model can react. Model failures, cancellation and
//! the iteration cap end the turn with an error while keeping everything
//! appended so far.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::Value;
use strum_macros::Display;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::{ModelStream, Provider, StreamErrorKind, StreamEvent, StreamRequest};
use crate::app::conversation::{ConversationError, ConversationState, Message};
use crate::config::{AgentSettings, LlmConfig};
use crate::tools::{RegistryWarning, ToolCallRequest, ToolError, ToolRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum LoopState {
    Idle,
    Streaming,
    AwaitingTools,
    Done,
    Failed,
}

/// Progress of a running turn, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    StateChanged(LoopState),
    TextDelta(String),
    ToolCallStarted {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolCallFinished {
        id: String,
        name: String,
        is_error: bool,
    },
    Warning(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentLoopError {
    #[error("Model backend error ({kind}): {detail}")]
    ModelBackend {
        kind: StreamErrorKind,
        detail: String,
    },

    #[error("Stopped after {cap} model requests without a final answer")]
    IterationCapExceeded { cap: usize },

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Conversation is not in a valid state for a new turn: {0}")]
    InvalidState(#[from] ConversationError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentLoopConfig {
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Maximum number of model streams opened per turn.
    pub max_iterations: usize,
    pub tool_timeout: Duration,
    pub stream_open_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl AgentLoopConfig {
    pub fn from_settings(llm: &LlmConfig, agent: &AgentSettings) -> Self {
        Self {
            model: llm.model.clone(),
            system_prompt: agent.system_prompt.clone(),
            temperature: Some(llm.temperature),
            max_tokens: Some(llm.max_tokens),
            max_iterations: agent.max_iterations,
            tool_timeout: agent.tool_timeout(),
            stream_open_timeout: agent.stream_open_timeout(),
            stream_idle_timeout: agent.stream_idle_timeout(),
        }
    }
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self::from_settings(&LlmConfig::default(), &AgentSettings::default())
    }
}

/// Result of a turn that ended with a final answer.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Content of the final assistant message.
    pub text: String,
    /// The whole transcript after the turn.
    pub transcript: Vec<Message>,
    /// Model streams opened during the turn.
    pub iterations: usize,
}

enum StreamOutcome {
    Completed(Message),
    Failed(AgentLoopError),
}

pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    registry: Arc<ToolRegistry>,
    config: AgentLoopConfig,
    conversation: ConversationState,
    state: LoopState,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        registry: Arc<ToolRegistry>,
        config: AgentLoopConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            config,
            conversation: ConversationState::new(),
            state: LoopState::Idle,
        }
    }

    pub fn with_conversation(mut self, conversation: ConversationState) -> Self {
        self.conversation = conversation;
        self
    }

    pub fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn config(&self) -> &AgentLoopConfig {
        &self.config
    }

    pub fn set_system_prompt(&mut self, prompt: Option<String>) {
        self.config.system_prompt = prompt;
    }

    pub fn set_provider(&mut self, provider: Arc<dyn Provider>) {
        self.provider = provider;
    }

    pub fn clear(&mut self) {
        self.conversation.clear();
        self.state = LoopState::Idle;
    }

    async fn transition(&mut self, state: LoopState, events: &mpsc::Sender<TurnEvent>) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "agent loop state change");
            self.state = state;
            let _ = events.send(TurnEvent::StateChanged(state)).await;
        }
    }

    async fn fail(
        &mut self,
        error: AgentLoopError,
        events: &mpsc::Sender<TurnEvent>,
    ) -> Result<TurnOutcome, AgentLoopError> {
        warn!(error = %error, messages = self.conversation.len(), "turn failed");
        self.transition(LoopState::Failed, events).await;
        Err(error)
    }

    /// Runs one turn to completion.
    ///
    /// On error the transcript keeps every message appended before the
    /// failure and remains valid for the next turn.
    #[instrument(skip_all, fields(model = %self.config.model))]
    pub async fn run_turn(
        &mut self,
        text: impl Into<String>,
        events: &mpsc::Sender<TurnEvent>,
        token: CancellationToken,
    ) -> Result<TurnOutcome, AgentLoopError> {
        self.state = LoopState::Idle;
        match self.drive_turn(text.into(), events, &token).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => self.fail(error, events).await,
        }
    }

    async fn drive_turn(
        &mut self,
        text: String,
        events: &mpsc::Sender<TurnEvent>,
        token: &CancellationToken,
    ) -> Result<TurnOutcome, AgentLoopError> {
        let mut warnings = self.registry.subscribe_warnings();
        self.conversation.push(Message::user(text))?;
        self.transition(LoopState::Streaming, events).await;

        let mut iterations = 0;
        loop {
            if iterations >= self.config.max_iterations {
                return Err(AgentLoopError::IterationCapExceeded {
                    cap: self.config.max_iterations,
                });
            }
            iterations += 1;
            info!(iteration = iterations, "opening model stream");

            let message = match self.stream_once(events, token).await {
                StreamOutcome::Completed(message) => message,
                StreamOutcome::Failed(error) => return Err(error),
            };

            let tool_calls = message.tool_calls.clone();
            let content = message.content.clone();
            self.conversation.push(message)?;

            if tool_calls.is_empty() {
                forward_warnings(&mut warnings, events).await;
                self.transition(LoopState::Done, events).await;
                info!(iterations, "turn complete");
                return Ok(TurnOutcome {
                    text: content,
                    transcript: self.conversation.messages().to_vec(),
                    iterations,
                });
            }

            self.transition(LoopState::AwaitingTools, events).await;
            let cancelled = self.run_tools(tool_calls, events, token).await?;
            forward_warnings(&mut warnings, events).await;
            if cancelled {
                return Err(AgentLoopError::Cancelled);
            }
            self.transition(LoopState::Streaming, events).await;
        }
    }

    async fn stream_once(
        &self,
        events: &mpsc::Sender<TurnEvent>,
        token: &CancellationToken,
    ) -> StreamOutcome {
        let request = StreamRequest {
            model: self.config.model.clone(),
            system: self.config.system_prompt.clone(),
            messages: self.conversation.messages().to_vec(),
            tools: self.registry.descriptors().await,
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let stream_token = token.child_token();
        let open = tokio::time::timeout(
            self.config.stream_open_timeout,
            ModelStream::open(self.provider.as_ref(), request, stream_token.clone()),
        );
        let mut stream = tokio::select! {
            biased;
            () = token.cancelled() => return StreamOutcome::Failed(AgentLoopError::Cancelled),
            opened = open => match opened {
                Ok(stream) => stream,
                Err(_) => {
                    stream_token.cancel();
                    return StreamOutcome::Failed(AgentLoopError::ModelBackend {
                        kind: StreamErrorKind::Timeout,
                        detail: format!(
                            "model stream did not open within {}s",
                            self.config.stream_open_timeout.as_secs()
                        ),
                    });
                }
            },
        };

        let mut streamed_text = false;
        loop {
            let next = tokio::select! {
                biased;
                () = token.cancelled() => return StreamOutcome::Failed(AgentLoopError::Cancelled),
                next = tokio::time::timeout(self.config.stream_idle_timeout, stream.next()) => next,
            };

            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => {
                    return StreamOutcome::Failed(AgentLoopError::ModelBackend {
                        kind: StreamErrorKind::MalformedStream,
                        detail: "model stream ended without a final message".to_string(),
                    });
                }
                Err(_) => {
                    stream_token.cancel();
                    return StreamOutcome::Failed(AgentLoopError::ModelBackend {
                        kind: StreamErrorKind::Timeout,
                        detail: format!(
                            "no model output for {}s",
                            self.config.stream_idle_timeout.as_secs()
                        ),
                    });
                }
            };

            match event {
                StreamEvent::TextDelta(text) => {
                    streamed_text = true;
                    let _ = events.send(TurnEvent::TextDelta(text)).await;
                }
                StreamEvent::ToolCallDelta(delta) => {
                    debug!(call_id = %delta.id, "tool call fragment");
                }
                StreamEvent::Completed(message) => {
                    if !streamed_text && !message.content.is_empty() {
                        let _ = events
                            .send(TurnEvent::TextDelta(message.content.clone()))
                            .await;
                    }
                    return StreamOutcome::Completed(message);
                }
                StreamEvent::Error(error) => {
                    return StreamOutcome::Failed(AgentLoopError::ModelBackend {
                        kind: error.kind,
                        detail: error.message,
                    });
                }
            }
        }
    }

    /// Dispatches every call concurrently and appends the results in request
    /// order. Returns `true` if the turn was cancelled while waiting, in which
    /// case unfinished calls are answered with a cancellation error.
    async fn run_tools(
        &mut self,
        calls: Vec<ToolCallRequest>,
        events: &mpsc::Sender<TurnEvent>,
        token: &CancellationToken,
    ) -> Result<bool, AgentLoopError> {
        info!(count = calls.len(), "dispatching tool calls");

        for call in &calls {
            let _ = events
                .send(TurnEvent::ToolCallStarted {
                    id: call.id.clone(),
                    name: call.tool_name.clone(),
                    arguments: call.arguments.clone(),
                })
                .await;
        }

        let mut pending: FuturesUnordered<_> = calls
            .iter()
            .cloned()
            .enumerate()
            .map(|(index, call)| {
                let registry = Arc::clone(&self.registry);
                let events = events.clone();
                let timeout = self.config.tool_timeout;
                let token = token.clone();
                let handle = tokio::spawn(async move {
                    let content = match registry.dispatch(&call, timeout).await {
                        Ok(content) => Ok(content),
                        Err(err) => {
                            debug!(tool = %call.tool_name, call_id = %call.id, error = %err, "tool call failed");
                            Err(err.to_result_content())
                        }
                    };
                    if !token.is_cancelled() {
                        let _ = events
                            .send(TurnEvent::ToolCallFinished {
                                id: call.id.clone(),
                                name: call.tool_name.clone(),
                                is_error: content.is_err(),
                            })
                            .await;
                    }
                    content
                });
                async move { (index, handle.await) }
            })
            .collect();

        let mut results: Vec<Option<String>> = vec![None; calls.len()];
        let mut cancelled = false;
        while !pending.is_empty() {
            tokio::select! {
                biased;
                () = token.cancelled() => {
                    cancelled = true;
                    break;
                }
                Some((index, joined)) = pending.next() => {
                    let content = match joined {
                        Ok(Ok(content) | Err(content)) => content,
                        Err(join_error) => ToolError::Execution {
                            tool_name: calls[index].tool_name.clone(),
                            message: format!("tool task failed: {join_error}"),
                        }
                        .to_result_content(),
                    };
                    results[index] = Some(content);
                }
            }
        }

        for (call, result) in calls.iter().zip(results) {
            let content = result.unwrap_or_else(|| {
                ToolError::Cancelled(call.tool_name.clone()).to_result_content()
            });
            self.conversation
                .push(Message::tool_result(call.id.clone(), content))?;
        }
        Ok(cancelled)
    }
}

async fn forward_warnings(
    warnings: &mut broadcast::Receiver<RegistryWarning>,
    events: &mpsc::Sender<TurnEvent>,
) {
    loop {
        match warnings.try_recv() {
            Ok(warning) => {
                let _ = events.send(TurnEvent::Warning(warning.to_string())).await;
            }
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                warn!(skipped, "dropped registry warnings");
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeTool, FakeToolServer, ScriptedProvider, text_reply, tool_call_reply};
    use crate::tools::ConnectionOptions;
    use crate::tools::error::is_error_result;
    use serde_json::json;

    fn config(max_iterations: usize) -> AgentLoopConfig {
        AgentLoopConfig {
            model: "test-model".to_string(),
            max_iterations,
            tool_timeout: Duration::from_secs(5),
            ..AgentLoopConfig::default()
        }
    }

    async fn registry_with(server: FakeToolServer) -> Arc<ToolRegistry> {
        let registry = Arc::new(ToolRegistry::new());
        let connection = server.connect(&ConnectionOptions::default()).await.unwrap();
        registry.register(connection).await.unwrap();
        registry
    }

    fn drain(mut rx: mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn text_only_turn_opens_one_stream() {
        let provider = Arc::new(ScriptedProvider::new(vec![text_reply("Hello there")]));
        let mut agent_loop = AgentLoop::new(
            provider.clone(),
            Arc::new(ToolRegistry::new()),
            config(5),
        );
        let (tx, rx) = mpsc::channel(64);

        let outcome = agent_loop
            .run_turn("hi", &tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.text, "Hello there");
        assert_eq!(outcome.iterations, 1);
        assert_eq!(provider.open_count(), 1);
        assert_eq!(agent_loop.state(), LoopState::Done);
        assert_eq!(
            outcome.transcript,
            vec![Message::user("hi"), Message::assistant("Hello there", vec![])]
        );

        let events = drain(rx);
        assert_eq!(
            events,
            vec![
                TurnEvent::StateChanged(LoopState::Streaming),
                TurnEvent::TextDelta("Hello there".to_string()),
                TurnEvent::StateChanged(LoopState::Done),
            ]
        );
    }

    #[tokio::test]
    async fn tool_result_is_fed_back_to_the_model() {
        let registry =
            registry_with(FakeToolServer::new("files").with_tool(FakeTool::reply("read_file", "contents"))).await;
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call_reply(&[("c1", "read_file", json!({"path": "a.txt"}))]),
            text_reply("The file says contents"),
        ]));
        let mut agent_loop = AgentLoop::new(provider.clone(), registry, config(5));
        let (tx, _rx) = mpsc::channel(64);

        let outcome = agent_loop
            .run_turn("read a.txt", &tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.transcript[2], Message::tool_result("c1", "contents"));
        let requests = provider.requests();
        assert_eq!(requests[1].messages.len(), 3);
        assert_eq!(requests[0].tools[0].name, "read_file");
    }

    #[tokio::test]
    async fn repeated_call_ids_fail_the_turn_before_dispatch() {
        let server = FakeToolServer::new("files").with_tool(FakeTool::reply("read_file", "x"));
        let registry = registry_with(server.clone()).await;
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call_reply(&[
                ("dup", "read_file", json!({})),
                ("dup", "read_file", json!({})),
            ]),
            text_reply("next turn"),
        ]));
        let mut agent_loop = AgentLoop::new(provider, registry, config(5));
        let (tx, _rx) = mpsc::channel(64);

        let err = agent_loop
            .run_turn("read twice", &tx, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AgentLoopError::InvalidState(ConversationError::DuplicateToolCall("dup".to_string()))
        );
        assert_eq!(agent_loop.state(), LoopState::Failed);
        assert!(server.calls().is_empty());
        assert_eq!(agent_loop.conversation().messages(), &[Message::user("read twice")]);

        let outcome = agent_loop
            .run_turn("try again", &tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.text, "next turn");
        ConversationState::from_messages(outcome.transcript).unwrap();
    }

    #[tokio::test]
    async fn tool_failures_become_error_payloads() {
        let registry =
            registry_with(FakeToolServer::new("files").with_tool(FakeTool::fail("read_file", "no such file"))).await;
        let provider = Arc::new(ScriptedProvider::new(vec![
            tool_call_reply(&[
                ("c1", "read_file", json!({})),
                ("c2", "write_file", json!({})),
            ]),
            text_reply("Sorry"),
        ]));
        let mut agent_loop = AgentLoop::new(provider, registry, config(5));
        let (tx, rx) = mpsc::channel(64);

        let outcome = agent_loop
            .run_turn("go", &tx, CancellationToken::new())
            .await
            .unwrap();

        let first: Value = serde_json::from_str(&outcome.transcript[2].content).unwrap();
        assert_eq!(first["error"]["kind"], "tool_execution");
        assert_eq!(first["error"]["message"], "no such file");
        let second: Value = serde_json::from_str(&outcome.transcript[3].content).unwrap();
        assert_eq!(second["error"]["kind"], "unknown_tool");

        let finished: Vec<_> = drain(rx)
            .into_iter()
            .filter_map(|event| match event {
                TurnEvent::ToolCallFinished { is_error, .. } => Some(is_error),
                _ => None,
            })
            .collect();
        assert_eq!(finished, vec![true, true]);
    }

    #[tokio::test]
    async fn model_error_fails_turn_and_keeps_transcript() {
        let provider = Arc::new(ScriptedProvider::new(vec![vec![StreamEvent::Error(
            crate::api::StreamError::new(StreamErrorKind::RateLimited, "slow down"),
        )]]));
        let mut agent_loop = AgentLoop::new(provider, Arc::new(ToolRegistry::new()), config(5));
        let (tx, _rx) = mpsc::channel(64);

        let err = agent_loop
            .run_turn("hi", &tx, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AgentLoopError::ModelBackend {
                kind: StreamErrorKind::RateLimited,
                detail: "slow down".to_string(),
            }
        );
        assert_eq!(agent_loop.state(), LoopState::Failed);
        assert_eq!(agent_loop.conversation().messages(), &[Message::user("hi")]);
    }

    #[tokio::test]
    async fn idle_stream_times_out() {
        let provider = Arc::new(ScriptedProvider::new(vec![]).with_stall());
        let mut agent_loop = AgentLoop::new(
            provider,
            Arc::new(ToolRegistry::new()),
            AgentLoopConfig {
                stream_idle_timeout: Duration::from_millis(20),
                ..config(5)
            },
        );
        let (tx, _rx) = mpsc::channel(64);

        let err = agent_loop
            .run_turn("hi", &tx, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AgentLoopError::ModelBackend { kind: StreamErrorKind::Timeout, .. }
        ));
    }

    #[tokio::test]
    async fn cancellation_answers_outstanding_calls() {
        let registry = registry_with(
            FakeToolServer::new("slow").with_tool(FakeTool::hang("wait")),
        )
        .await;
        let provider = Arc::new(ScriptedProvider::new(vec![tool_call_reply(&[(
            "c1",
            "wait",
            json!({}),
        )])]));
        let mut agent_loop = AgentLoop::new(provider, registry, config(5));
        let (tx, _rx) = mpsc::channel(64);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let err = agent_loop.run_turn("wait", &tx, token).await.unwrap_err();

        assert_eq!(err, AgentLoopError::Cancelled);
        let messages = agent_loop.conversation().messages();
        assert_eq!(messages.len(), 3);
        assert!(is_error_result(&messages[2].content));
        assert!(messages[2].content.contains("cancelled"));
        assert!(agent_loop.conversation().pending_tool_calls().is_empty());

        // The transcript accepts the next user message.
        let provider = Arc::new(ScriptedProvider::new(vec![text_reply("ok")]));
        agent_loop.set_provider(provider);
        agent_loop
            .run_turn("next", &tx, CancellationToken::new())
            .await
            .unwrap();
    }
}
