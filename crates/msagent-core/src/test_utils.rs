//! Test utilities for msagent-core
//!
//! In-memory tool servers and scripted model providers, shared by unit tests
//! and the integration tests under `tests/`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, Provider, ProviderStream, StreamError, StreamErrorKind, StreamEvent, StreamRequest, ToolCallDelta};
use crate::app::conversation::Message;
use crate::tools::mcp::protocol::{JSONRPC_VERSION, MCP_PROTOCOL_VERSION};
use crate::tools::{ConnectionOptions, McpError, ToolCallRequest, ToolServerConnection};

const DUPLEX_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone)]
enum FakeBehavior {
    Reply(String),
    Fail(String),
    Delayed(Duration, String),
    Exit,
    Hang,
    Raw(Value),
}

/// One tool exposed by a [`FakeToolServer`].
#[derive(Debug, Clone)]
pub struct FakeTool {
    name: String,
    schema: Value,
    behavior: FakeBehavior,
}

impl FakeTool {
    fn new(name: &str, behavior: FakeBehavior) -> Self {
        Self {
            name: name.to_string(),
            schema: json!({ "type": "object", "properties": {} }),
            behavior,
        }
    }

    /// Answers every call with `text`.
    pub fn reply(name: &str, text: &str) -> Self {
        Self::new(name, FakeBehavior::Reply(text.to_string()))
    }

    /// Answers every call with an `isError` result carrying `text`.
    pub fn fail(name: &str, text: &str) -> Self {
        Self::new(name, FakeBehavior::Fail(text.to_string()))
    }

    /// Waits `delay` before answering; the server handles nothing else meanwhile.
    pub fn delayed(name: &str, delay: Duration, text: &str) -> Self {
        Self::new(name, FakeBehavior::Delayed(delay, text.to_string()))
    }

    /// Closes the server's end of the transport when called.
    pub fn exit(name: &str) -> Self {
        Self::new(name, FakeBehavior::Exit)
    }

    /// Never answers.
    pub fn hang(name: &str) -> Self {
        Self::new(name, FakeBehavior::Hang)
    }

    /// Answers every call with `result` as-is, valid or not.
    pub fn raw_result(name: &str, result: Value) -> Self {
        Self::new(name, FakeBehavior::Raw(result))
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }
}

/// An MCP server living in the test process, reached over an in-memory pipe.
#[derive(Debug, Clone)]
pub struct FakeToolServer {
    name: String,
    tools: Vec<FakeTool>,
    malformed_handshake: bool,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl FakeToolServer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tools: Vec::new(),
            malformed_handshake: false,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_tool(mut self, tool: FakeTool) -> Self {
        self.tools.push(tool);
        self
    }

    /// Answers `initialize` without a protocol version.
    pub fn with_malformed_handshake(mut self) -> Self {
        self.malformed_handshake = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every `tools/call` received so far, as `(tool name, arguments)`.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Starts a fresh server task and connects to it.
    pub async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Arc<ToolServerConnection>, McpError> {
        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);
        tokio::spawn(serve(
            server,
            self.tools.clone(),
            self.malformed_handshake,
            Arc::clone(&self.calls),
        ));
        let (reader, writer) = tokio::io::split(client);
        ToolServerConnection::connect(self.name.clone(), reader, writer, options).await
    }
}

fn success(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result })
}

fn failure(id: Value, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "error": { "code": code, "message": message } })
}

fn text_result(text: &str, is_error: bool) -> Value {
    json!({ "content": [{ "type": "text", "text": text }], "isError": is_error })
}

async fn serve(
    stream: DuplexStream,
    tools: Vec<FakeTool>,
    malformed_handshake: bool,
    calls: Arc<Mutex<Vec<(String, Value)>>>,
) {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        // Notifications carry no id and get no answer.
        let Some(id) = message.get("id").filter(|id| !id.is_null()).cloned() else {
            continue;
        };
        let method = message.get("method").and_then(Value::as_str).unwrap_or_default();

        let response = match method {
            "initialize" if malformed_handshake => success(id, json!({ "capabilities": {} })),
            "initialize" => success(
                id,
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "fake", "version": "0.1.0" }
                }),
            ),
            "tools/list" => {
                let listed: Vec<Value> = tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "name": tool.name,
                            "description": format!("fake {}", tool.name),
                            "inputSchema": tool.schema,
                        })
                    })
                    .collect();
                success(id, json!({ "tools": listed }))
            }
            "tools/call" => {
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                calls
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push((name.clone(), arguments));

                match tools.iter().find(|tool| tool.name == name).map(|t| &t.behavior) {
                    None => failure(id, -32602, &format!("Unknown tool: {name}")),
                    Some(FakeBehavior::Reply(text)) => success(id, text_result(text, false)),
                    Some(FakeBehavior::Fail(text)) => success(id, text_result(text, true)),
                    Some(FakeBehavior::Delayed(delay, text)) => {
                        tokio::time::sleep(*delay).await;
                        success(id, text_result(text, false))
                    }
                    Some(FakeBehavior::Raw(result)) => success(id, result.clone()),
                    Some(FakeBehavior::Exit) => return,
                    Some(FakeBehavior::Hang) => {
                        std::future::pending::<()>().await;
                        return;
                    }
                }
            }
            "ping" => success(id, json!({})),
            other => failure(id, -32601, &format!("Method not found: {other}")),
        };

        let mut encoded = response.to_string();
        encoded.push('\n');
        if writer.write_all(encoded.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// A [`Provider`] that replays prepared event scripts, one per stream open.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    fallback: Option<Vec<StreamEvent>>,
    stall: bool,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        }
    }

    /// Replayed for every open once the queued scripts run out.
    pub fn with_fallback(mut self, script: Vec<StreamEvent>) -> Self {
        self.fallback = Some(script);
        self
    }

    /// Opens after the queued scripts produce a stream that never yields.
    pub fn with_stall(mut self) -> Self {
        self.stall = true;
        self
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn open_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn stream(
        &self,
        request: StreamRequest,
        _token: CancellationToken,
    ) -> Result<ProviderStream, ApiError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);

        let next = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .or_else(|| self.fallback.clone());

        match next {
            Some(events) => Ok(Box::pin(stream::iter(events))),
            None if self.stall => Ok(Box::pin(stream::pending())),
            None => Ok(Box::pin(stream::iter(vec![StreamEvent::Error(
                StreamError::new(StreamErrorKind::Provider, "no scripted response left"),
            )]))),
        }
    }
}

/// A stream that answers with plain text.
pub fn text_reply(text: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::TextDelta(text.to_string()),
        StreamEvent::Completed(Message::assistant(text, vec![])),
    ]
}

/// A stream that requests the given `(id, tool name, arguments)` calls.
pub fn tool_call_reply(calls: &[(&str, &str, Value)]) -> Vec<StreamEvent> {
    let mut events: Vec<StreamEvent> = calls
        .iter()
        .map(|(id, name, arguments)| {
            StreamEvent::ToolCallDelta(ToolCallDelta {
                id: (*id).to_string(),
                name: Some((*name).to_string()),
                arguments: arguments.to_string(),
            })
        })
        .collect();
    let requests = calls
        .iter()
        .map(|(id, name, arguments)| ToolCallRequest::new(*id, *name, arguments.clone()))
        .collect();
    events.push(StreamEvent::Completed(Message::assistant("", requests)));
    events
}
