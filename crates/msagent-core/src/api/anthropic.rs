use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::error::{ApiError, StreamError, StreamErrorKind};
use crate::api::provider::{Provider, ProviderStream, StreamEvent, StreamRequest};
use crate::api::sse::{SseStream, parse_sse_stream};
use crate::api::stream::StreamAssembler;
use crate::api::util::{error_for_response, streaming_client, trim_base_url};
use crate::app::conversation::{Message, Role};
use crate::tools::{ToolDescriptor, error::is_error_result};

pub const PROVIDER_NAME: &str = "anthropic";
pub const DEFAULT_API_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClaudeContent {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ClaudeMessage {
    role: &'static str,
    content: Vec<ClaudeContent>,
}

#[derive(Debug, Serialize)]
struct ClaudeTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Serialize)]
struct ClaudeRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<ClaudeMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ClaudeTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClaudeStreamEvent {
    #[serde(rename = "message_start")]
    MessageStart {},
    #[serde(rename = "content_block_start")]
    ContentBlockStart {
        index: usize,
        content_block: ClaudeContentBlockStart,
    },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: usize, delta: ClaudeDelta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: usize },
    #[serde(rename = "message_delta")]
    MessageDelta {},
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "error")]
    Error { error: ClaudeStreamError },
}

#[derive(Debug, Deserialize)]
struct ClaudeContentBlockStart {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClaudeDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ClaudeStreamError {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

fn text_block(text: &str) -> Option<ClaudeContent> {
    (!text.is_empty()).then(|| ClaudeContent::Text {
        text: text.to_string(),
    })
}

/// Converts the transcript into Messages API turns. Consecutive tool results
/// are sent together in one user turn.
fn convert_messages(messages: &[Message]) -> Vec<ClaudeMessage> {
    let mut converted: Vec<ClaudeMessage> = Vec::with_capacity(messages.len());

    for message in messages {
        match message.role {
            Role::User => converted.push(ClaudeMessage {
                role: "user",
                content: text_block(&message.content).into_iter().collect(),
            }),
            Role::Assistant => {
                let mut content: Vec<ClaudeContent> =
                    text_block(&message.content).into_iter().collect();
                content.extend(message.tool_calls.iter().map(|call| ClaudeContent::ToolUse {
                    id: call.id.clone(),
                    name: call.tool_name.clone(),
                    input: if call.arguments.is_object() {
                        call.arguments.clone()
                    } else {
                        Value::Object(serde_json::Map::new())
                    },
                }));
                if content.is_empty() {
                    content.push(ClaudeContent::Text {
                        text: "(no content)".to_string(),
                    });
                }
                converted.push(ClaudeMessage {
                    role: "assistant",
                    content,
                });
            }
            Role::Tool => {
                let block = ClaudeContent::ToolResult {
                    tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                    content: message.content.clone(),
                    is_error: is_error_result(&message.content),
                };
                match converted.last_mut() {
                    Some(last)
                        if last.role == "user"
                            && matches!(last.content.first(), Some(ClaudeContent::ToolResult { .. })) =>
                    {
                        last.content.push(block);
                    }
                    _ => converted.push(ClaudeMessage {
                        role: "user",
                        content: vec![block],
                    }),
                }
            }
        }
    }
    converted
}

fn convert_tools(tools: &[ToolDescriptor]) -> Vec<ClaudeTool> {
    tools
        .iter()
        .map(|tool| ClaudeTool {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
        })
        .collect()
}

#[derive(Clone)]
pub struct AnthropicClient {
    http_client: reqwest::Client,
    url: String,
    api_key: String,
}

impl AnthropicClient {
    pub fn new(api_key: String, base_url: Option<&str>) -> Result<Self, ApiError> {
        let base = trim_base_url(base_url, DEFAULT_API_URL);
        let url = if base.ends_with("/v1") {
            format!("{base}/messages")
        } else {
            format!("{base}/v1/messages")
        };
        Ok(Self {
            http_client: streaming_client()?,
            url,
            api_key,
        })
    }
}

#[async_trait]
impl Provider for AnthropicClient {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn stream(
        &self,
        request: StreamRequest,
        token: CancellationToken,
    ) -> Result<ProviderStream, ApiError> {
        let body = ClaudeRequest {
            model: request.model,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: convert_messages(&request.messages),
            stream: true,
            system: request.system,
            tools: convert_tools(&request.tools),
            temperature: request.temperature,
        };

        let send = self
            .http_client
            .post(&self.url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send();

        let response = tokio::select! {
            biased;
            () = token.cancelled() => {
                return Err(ApiError::Cancelled { provider: PROVIDER_NAME.to_string() });
            }
            response = send => response?,
        };

        if !response.status().is_success() {
            return Err(error_for_response(PROVIDER_NAME, response).await);
        }

        Ok(convert_claude_stream(
            parse_sse_stream(response.bytes_stream()),
            token,
        ))
    }
}

fn convert_claude_stream(mut sse_stream: SseStream, token: CancellationToken) -> ProviderStream {
    Box::pin(async_stream::stream! {
        let mut assembler = StreamAssembler::new();
        let mut tool_ids_by_block: HashMap<usize, String> = HashMap::new();

        loop {
            let next = tokio::select! {
                biased;
                () = token.cancelled() => None,
                event = sse_stream.next() => Some(event),
            };
            let Some(event) = next else {
                yield StreamEvent::Error(StreamError::new(StreamErrorKind::Cancelled, "request cancelled"));
                return;
            };
            let Some(event) = event else {
                return;
            };

            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    yield StreamEvent::Error(StreamError::from(e));
                    return;
                }
            };

            let stream_event: ClaudeStreamEvent = match serde_json::from_str(&event.data) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!(target: "anthropic::stream", "Skipping unrecognized event: {} data: {}", e, event.data);
                    continue;
                }
            };

            match stream_event {
                ClaudeStreamEvent::ContentBlockStart { index, content_block } => {
                    if content_block.block_type == "tool_use" {
                        if let (Some(id), Some(name)) = (content_block.id, content_block.name) {
                            let delta = assembler.push_tool_delta(&id, Some(&name), "");
                            tool_ids_by_block.insert(index, id);
                            yield StreamEvent::ToolCallDelta(delta);
                        }
                    }
                }
                ClaudeStreamEvent::ContentBlockDelta { delta: ClaudeDelta::TextDelta { text }, .. } => {
                    assembler.push_text(&text);
                    yield StreamEvent::TextDelta(text);
                }
                ClaudeStreamEvent::ContentBlockDelta { index, delta: ClaudeDelta::InputJsonDelta { partial_json } } => {
                    if let Some(id) = tool_ids_by_block.get(&index) {
                        let delta = assembler.push_tool_delta(id, None, &partial_json);
                        yield StreamEvent::ToolCallDelta(delta);
                    }
                }
                ClaudeStreamEvent::ContentBlockStop { index } => {
                    if let Some(id) = tool_ids_by_block.remove(&index) {
                        assembler.complete_call(&id);
                    }
                }
                ClaudeStreamEvent::MessageStop => {
                    yield StreamEvent::Completed(std::mem::take(&mut assembler).finish());
                    return;
                }
                ClaudeStreamEvent::Error { error } => {
                    let kind = StreamErrorKind::from_provider_error_type(&error.error_type);
                    yield StreamEvent::Error(StreamError::new(kind, error.message));
                    return;
                }
                ClaudeStreamEvent::ContentBlockDelta { delta: ClaudeDelta::Other, .. }
                | ClaudeStreamEvent::MessageStart {}
                | ClaudeStreamEvent::MessageDelta {}
                | ClaudeStreamEvent::Ping => {}
            }
        }
    })
}
