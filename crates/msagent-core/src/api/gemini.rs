use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::error::{ApiError, StreamError, StreamErrorKind};
use crate::api::provider::{Provider, ProviderStream, StreamEvent, StreamRequest};
use crate::api::sse::{SseStream, parse_sse_stream};
use crate::api::stream::StreamAssembler;
use crate::api::util::{error_for_response, streaming_client, trim_base_url};
use crate::app::conversation::{Message, Role};
use crate::tools::ToolDescriptor;

pub const PROVIDER_NAME: &str = "gemini";
pub const DEFAULT_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Schema keywords the Gemini function-declaration format rejects.
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["$schema", "$id", "additionalProperties", "examples"];

#[derive(Debug, Clone, PartialEq, Serialize)]
struct GeminiContent {
    role: &'static str,
    parts: Vec<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiResponseContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    function_call: Option<GeminiFunctionCall>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

fn convert_messages(messages: &[Message]) -> Vec<GeminiContent> {
    let mut tool_names: HashMap<&str, &str> = HashMap::new();
    let mut contents: Vec<GeminiContent> = Vec::with_capacity(messages.len());

    for message in messages {
        match message.role {
            Role::User => contents.push(GeminiContent {
                role: "user",
                parts: vec![json!({ "text": message.content })],
            }),
            Role::Assistant => {
                let mut parts = Vec::new();
                if !message.content.is_empty() {
                    parts.push(json!({ "text": message.content }));
                }
                for call in &message.tool_calls {
                    tool_names.insert(&call.id, &call.tool_name);
                    let args = if call.arguments.is_object() {
                        call.arguments.clone()
                    } else {
                        json!({})
                    };
                    parts.push(json!({ "functionCall": { "name": call.tool_name, "args": args } }));
                }
                if parts.is_empty() {
                    parts.push(json!({ "text": "" }));
                }
                contents.push(GeminiContent {
                    role: "model",
                    parts,
                });
            }
            Role::Tool => {
                let call_id = message.tool_call_id.as_deref().unwrap_or_default();
                let name = tool_names.get(call_id).copied().unwrap_or(call_id);
                let part = json!({
                    "functionResponse": {
                        "name": name,
                        "response": { "content": message.content }
                    }
                });
                match contents.last_mut() {
                    Some(last) if last.role == "function" => last.parts.push(part),
                    _ => contents.push(GeminiContent {
                        role: "function",
                        parts: vec![part],
                    }),
                }
            }
        }
    }
    contents
}

fn simplify_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), simplify_schema(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(simplify_schema).collect()),
        other => other.clone(),
    }
}

fn convert_tools(tools: &[ToolDescriptor]) -> Vec<Value> {
    if tools.is_empty() {
        return Vec::new();
    }
    let declarations: Vec<Value> = tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "parameters": simplify_schema(&tool.input_schema),
            })
        })
        .collect();
    vec![json!({ "functionDeclarations": declarations })]
}

#[derive(Clone)]
pub struct GeminiClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(api_key: String, base_url: Option<&str>) -> Result<Self, ApiError> {
        Ok(Self {
            http_client: streaming_client()?,
            base_url: trim_base_url(base_url, DEFAULT_API_URL),
            api_key,
        })
    }
}

#[async_trait]
impl Provider for GeminiClient {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn stream(
        &self,
        request: StreamRequest,
        token: CancellationToken,
    ) -> Result<ProviderStream, ApiError> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, request.model
        );
        let body = GeminiRequest {
            contents: convert_messages(&request.messages),
            system_instruction: request.system.map(|system| GeminiContent {
                role: "user",
                parts: vec![json!({ "text": system })],
            }),
            tools: convert_tools(&request.tools),
            generation_config: GeminiGenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            },
        };

        let send = self
            .http_client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
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

        Ok(convert_gemini_stream(
            parse_sse_stream(response.bytes_stream()),
            token,
        ))
    }
}

fn convert_gemini_stream(mut sse_stream: SseStream, token: CancellationToken) -> ProviderStream {
    Box::pin(async_stream::stream! {
        let mut assembler = StreamAssembler::new();
        let mut received_chunk = false;

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

            let chunk: GeminiResponse = match serde_json::from_str(&event.data) {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!(target: "gemini::stream", "Failed to parse chunk: {} data: {}", e, event.data);
                    continue;
                }
            };
            received_chunk = true;

            if let Some(error) = chunk.error {
                let kind = match error.status.as_str() {
                    "RESOURCE_EXHAUSTED" => StreamErrorKind::RateLimited,
                    "UNAUTHENTICATED" | "PERMISSION_DENIED" => StreamErrorKind::Authentication,
                    "INVALID_ARGUMENT" => StreamErrorKind::InvalidRequest,
                    "UNAVAILABLE" | "INTERNAL" => StreamErrorKind::Server,
                    _ => StreamErrorKind::Provider,
                };
                yield StreamEvent::Error(StreamError::new(kind, error.message));
                return;
            }

            let parts = chunk
                .candidates
                .into_iter()
                .filter_map(|candidate| candidate.content)
                .flat_map(|content| content.parts);
            for part in parts {
                if part.thought {
                    continue;
                }
                if let Some(text) = part.text.filter(|text| !text.is_empty()) {
                    assembler.push_text(&text);
                    yield StreamEvent::TextDelta(text);
                }
                if let Some(function_call) = part.function_call {
                    let id = format!("call_{}", uuid::Uuid::new_v4().simple());
                    let delta = assembler.push_tool_delta(
                        &id,
                        Some(&function_call.name),
                        &function_call.args.to_string(),
                    );
                    assembler.complete_call(&id);
                    yield StreamEvent::ToolCallDelta(delta);
                }
            }
        }

        if received_chunk {
            yield StreamEvent::Completed(assembler.finish());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolCallRequest;
    use futures::stream;
    use tokio_util::bytes::Bytes;

    fn sse(events: &[&str]) -> SseStream {
        let body: String = events.iter().map(|e| format!("data: {e}\n\n")).collect();
        parse_sse_stream(stream::once(async move {
            Ok::<_, std::io::Error>(Bytes::from(body))
        }))
    }

    #[tokio::test]
    async fn function_calls_get_synthesized_ids() {
        let events: Vec<_> = convert_gemini_stream(
            sse(&[
                r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Looking"}]}}]}"#,
                r#"{"candidates":[{"content":{"role":"model","parts":[{"functionCall":{"name":"read_file","args":{"path":"a"}}}]},"finishReason":"STOP"}]}"#,
            ]),
            CancellationToken::new(),
        )
        .collect()
        .await;

        let Some(StreamEvent::Completed(message)) = events.last() else {
            panic!("expected completion, got {events:?}");
        };
        assert_eq!(message.content, "Looking");
        assert_eq!(message.tool_calls.len(), 1);
        assert_eq!(message.tool_calls[0].tool_name, "read_file");
        assert_eq!(message.tool_calls[0].arguments, json!({"path": "a"}));
        assert!(message.tool_calls[0].id.starts_with("call_"));
    }

    #[tokio::test]
    async fn empty_stream_does_not_complete() {
        let events: Vec<_> = convert_gemini_stream(sse(&[]), CancellationToken::new())
            .collect()
            .await;
        assert!(events.is_empty());
    }

    #[test]
    fn tool_results_reference_function_names() {
        let contents = convert_messages(&[
            Message::user("go"),
            Message::assistant("", vec![ToolCallRequest::new("c1", "read_file", json!({}))]),
            Message::tool_result("c1", "data"),
        ]);

        assert_eq!(contents[1].role, "model");
        assert_eq!(contents[2].role, "function");
        assert_eq!(contents[2].parts[0]["functionResponse"]["name"], "read_file");
    }

    #[test]
    fn strips_unsupported_schema_keywords() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "additionalProperties": false,
            "properties": {"opts": {"type": "object", "additionalProperties": true}}
        });

        assert_eq!(
            simplify_schema(&schema),
            json!({"type": "object", "properties": {"opts": {"type": "object"}}})
        );
    }
}
