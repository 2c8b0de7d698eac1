//! OpenAI chat-completions streaming, also used for OpenAI-compatible
//! endpoints configured as the `custom` provider.

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
use crate::api::stream::{StreamAssembler, parse_arguments};
use crate::api::util::{error_for_response, normalize_chat_url, streaming_client};
use crate::app::conversation::{Message, Role};
use crate::tools::{ToolCallRequest, ToolDescriptor};

pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum OpenAIMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAIToolCall>>,
    },
    Tool {
        content: String,
        tool_call_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAIToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: OpenAIFunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAIFunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize)]
struct OpenAIFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    error: Option<OpenAIStreamError>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAIStreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAIStreamFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamError {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    error_type: Option<String>,
}

/// Encodes call arguments the way they were received from the model. Raw text
/// that never parsed as JSON is sent back verbatim.
fn encode_arguments(arguments: &Value) -> String {
    match arguments {
        Value::String(raw) if serde_json::from_str::<Value>(raw).is_err() => raw.clone(),
        other => other.to_string(),
    }
}

/// Converts a transcript into chat-completions messages.
pub fn to_wire_messages(system: Option<&str>, messages: &[Message]) -> Vec<OpenAIMessage> {
    let mut wire = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = system {
        wire.push(OpenAIMessage::System {
            content: system.to_string(),
        });
    }

    for message in messages {
        wire.push(match message.role {
            Role::User => OpenAIMessage::User {
                content: message.content.clone(),
            },
            Role::Assistant => {
                let tool_calls: Vec<OpenAIToolCall> = message
                    .tool_calls
                    .iter()
                    .map(|call| OpenAIToolCall {
                        id: call.id.clone(),
                        tool_type: "function".to_string(),
                        function: OpenAIFunctionCall {
                            name: call.tool_name.clone(),
                            arguments: encode_arguments(&call.arguments),
                        },
                    })
                    .collect();
                let content = if message.content.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(message.content.clone())
                };
                OpenAIMessage::Assistant {
                    content,
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                }
            }
            Role::Tool => OpenAIMessage::Tool {
                content: message.content.clone(),
                tool_call_id: message.tool_call_id.clone().unwrap_or_default(),
            },
        });
    }
    wire
}

/// Converts chat-completions messages back into a transcript, dropping
/// system messages.
pub fn from_wire_messages(wire: &[OpenAIMessage]) -> Vec<Message> {
    wire.iter()
        .filter_map(|message| match message {
            OpenAIMessage::System { .. } => None,
            OpenAIMessage::User { content } => Some(Message::user(content.clone())),
            OpenAIMessage::Assistant {
                content,
                tool_calls,
            } => {
                let calls = tool_calls
                    .iter()
                    .flatten()
                    .map(|call| ToolCallRequest {
                        id: call.id.clone(),
                        tool_name: call.function.name.clone(),
                        arguments: parse_arguments(&call.id, &call.function.arguments),
                    })
                    .collect();
                Some(Message::assistant(content.clone().unwrap_or_default(), calls))
            }
            OpenAIMessage::Tool {
                content,
                tool_call_id,
            } => Some(Message::tool_result(tool_call_id.clone(), content.clone())),
        })
        .collect()
}

fn wire_tools(tools: &[ToolDescriptor]) -> Option<Vec<OpenAITool>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|tool| OpenAITool {
                tool_type: "function",
                function: OpenAIFunction {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                },
            })
            .collect(),
    )
}

#[derive(Clone)]
pub struct OpenAIClient {
    http_client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    provider_name: &'static str,
}

impl OpenAIClient {
    pub fn new(
        provider_name: &'static str,
        api_key: Option<String>,
        base_url: Option<&str>,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            http_client: streaming_client()?,
            url: normalize_chat_url(base_url, DEFAULT_API_URL),
            api_key: api_key.filter(|key| !key.is_empty()),
            provider_name,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Provider for OpenAIClient {
    fn name(&self) -> &'static str {
        self.provider_name
    }

    async fn stream(
        &self,
        request: StreamRequest,
        token: CancellationToken,
    ) -> Result<ProviderStream, ApiError> {
        let body = OpenAIRequest {
            model: request.model,
            messages: to_wire_messages(request.system.as_deref(), &request.messages),
            stream: true,
            tools: wire_tools(&request.tools),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut builder = self.http_client.post(&self.url).json(&body);
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = tokio::select! {
            biased;
            () = token.cancelled() => {
                return Err(ApiError::Cancelled { provider: self.provider_name.to_string() });
            }
            response = builder.send() => response?,
        };

        if !response.status().is_success() {
            return Err(error_for_response(self.provider_name, response).await);
        }

        let sse_stream = parse_sse_stream(response.bytes_stream());
        Ok(convert_openai_stream(sse_stream, token))
    }
}

fn convert_openai_stream(mut sse_stream: SseStream, token: CancellationToken) -> ProviderStream {
    Box::pin(async_stream::stream! {
        let mut assembler = StreamAssembler::new();
        let mut ids_by_index: HashMap<usize, String> = HashMap::new();
        let mut finished = false;

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
                break;
            };

            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    yield StreamEvent::Error(StreamError::from(e));
                    return;
                }
            };

            if event.data.trim() == "[DONE]" {
                finished = true;
                break;
            }

            let chunk: OpenAIStreamChunk = match serde_json::from_str(&event.data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!(target: "openai::chat::stream", "Failed to parse chunk: {} data: {}", e, event.data);
                    continue;
                }
            };

            if let Some(error) = chunk.error {
                let kind = StreamErrorKind::from_provider_error_type(error.error_type.as_deref().unwrap_or_default());
                yield StreamEvent::Error(StreamError::new(kind, error.message));
                return;
            }

            for choice in chunk.choices {
                if let Some(text) = choice.delta.content.filter(|text| !text.is_empty()) {
                    assembler.push_text(&text);
                    yield StreamEvent::TextDelta(text);
                }

                for tool_call in choice.delta.tool_calls.unwrap_or_default() {
                    let id = match tool_call.id.filter(|id| !id.is_empty()) {
                        Some(id) => {
                            ids_by_index.insert(tool_call.index, id.clone());
                            id
                        }
                        None => ids_by_index
                            .entry(tool_call.index)
                            .or_insert_with(|| format!("call_{}", tool_call.index))
                            .clone(),
                    };
                    let (name, arguments) = match tool_call.function {
                        Some(function) => (function.name, function.arguments.unwrap_or_default()),
                        None => (None, String::new()),
                    };
                    let delta = assembler.push_tool_delta(&id, name.as_deref(), &arguments);
                    yield StreamEvent::ToolCallDelta(delta);
                }

                if choice.finish_reason.is_some() {
                    finished = true;
                }
            }
        }

        if finished {
            assembler.complete_all();
            yield StreamEvent::Completed(assembler.finish());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use serde_json::json;
    use tokio_util::bytes::Bytes;

    fn sse(events: &[&str]) -> SseStream {
        let body: String = events.iter().map(|e| format!("data: {e}\n\n")).collect();
        parse_sse_stream(stream::once(async move {
            Ok::<_, std::io::Error>(Bytes::from(body))
        }))
    }

    async fn collect(events: &[&str]) -> Vec<StreamEvent> {
        convert_openai_stream(sse(events), CancellationToken::new())
            .collect()
            .await
    }

    #[tokio::test]
    async fn text_stream_completes_on_done() {
        let events = collect(&[
            r#"{"choices":[{"delta":{"role":"assistant","content":"Hel"}}]}"#,
            r#"{"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ])
        .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta("Hel".into()),
                StreamEvent::TextDelta("lo".into()),
                StreamEvent::Completed(Message::assistant("Hello", vec![])),
            ]
        );
    }

    #[tokio::test]
    async fn interleaved_tool_call_fragments_are_assembled() {
        let events = collect(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"read_file","arguments":""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_b","function":{"name":"list_dir","arguments":"{\"path\""}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"path\":\"a\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"function":{"arguments":":\".\"}"}}]}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ])
        .await;

        let Some(StreamEvent::Completed(message)) = events.last() else {
            panic!("expected completion, got {events:?}");
        };
        assert_eq!(
            message.tool_calls,
            vec![
                ToolCallRequest::new("call_a", "read_file", json!({"path": "a"})),
                ToolCallRequest::new("call_b", "list_dir", json!({"path": "."})),
            ]
        );
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, StreamEvent::ToolCallDelta(_)))
                .count(),
            4
        );
    }

    #[tokio::test]
    async fn stream_without_finish_has_no_completion() {
        let events = collect(&[r#"{"choices":[{"delta":{"content":"partial"}}]}"#]).await;
        assert_eq!(events, vec![StreamEvent::TextDelta("partial".into())]);
    }

    #[tokio::test]
    async fn in_stream_error_is_terminal() {
        let events = collect(&[
            r#"{"error":{"message":"slow down","type":"rate_limit_exceeded"}}"#,
            r#"{"choices":[{"delta":{"content":"never"}}]}"#,
        ])
        .await;

        assert_eq!(
            events,
            vec![StreamEvent::Error(StreamError::new(
                StreamErrorKind::RateLimited,
                "slow down"
            ))]
        );
    }

    #[tokio::test]
    async fn cancelled_token_ends_stream_with_cancelled_error() {
        let token = CancellationToken::new();
        token.cancel();
        let events: Vec<_> = convert_openai_stream(sse(&["[DONE]"]), token).collect().await;

        assert!(matches!(
            events.as_slice(),
            [StreamEvent::Error(err)] if err.kind == StreamErrorKind::Cancelled
        ));
    }

    #[test]
    fn wire_messages_round_trip() {
        let history = vec![
            Message::user("list the files"),
            Message::assistant(
                "",
                vec![
                    ToolCallRequest::new("c1", "list_dir", json!({"path": "."})),
                    ToolCallRequest::new("c2", "read_file", json!("{\"path\": ")),
                ],
            ),
            Message::tool_result("c1", "a.txt\nb.txt"),
            Message::tool_result("c2", r#"{"error":{"kind":"invalid_arguments","message":"x"}}"#),
            Message::assistant("Two files.", vec![]),
        ];

        let wire = to_wire_messages(Some("be brief"), &history);
        let encoded = serde_json::to_string(&wire).unwrap();
        let decoded: Vec<OpenAIMessage> = serde_json::from_str(&encoded).unwrap();

        assert_eq!(from_wire_messages(&decoded), history);
        assert!(matches!(&decoded[0], OpenAIMessage::System { content } if content == "be brief"));
    }

    #[test]
    fn assistant_without_tool_calls_keeps_empty_content() {
        let wire = to_wire_messages(None, &[Message::assistant("", vec![])]);
        assert_eq!(
            serde_json::to_value(&wire[0]).unwrap(),
            json!({"role": "assistant", "content": ""})
        );
    }
}
