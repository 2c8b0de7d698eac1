use std::collections::HashMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream;
use futures_core::Stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::error::{StreamError, StreamErrorKind};
use crate::api::provider::{Provider, ProviderStream, StreamEvent, StreamRequest, ToolCallDelta};
use crate::app::conversation::Message;
use crate::tools::ToolCallRequest;

#[derive(Debug, Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
    complete: bool,
}

/// Accumulates streamed fragments into a final assistant message.
///
/// Tool calls are tracked by id in the order they first appear and are only
/// included in the final message once the provider marked them complete.
#[derive(Debug, Default)]
pub struct StreamAssembler {
    text: String,
    calls: Vec<ToolCallBuilder>,
    index_by_id: HashMap<String, usize>,
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&mut self, text: &str) {
        self.text.push_str(text);
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    fn builder(&mut self, id: &str) -> &mut ToolCallBuilder {
        let index = match self.index_by_id.get(id).copied() {
            Some(index) => index,
            None => {
                self.calls.push(ToolCallBuilder {
                    id: id.to_string(),
                    ..ToolCallBuilder::default()
                });
                let index = self.calls.len() - 1;
                self.index_by_id.insert(id.to_string(), index);
                index
            }
        };
        &mut self.calls[index]
    }

    /// Applies one fragment and returns it as an event for consumers.
    pub fn push_tool_delta(
        &mut self,
        id: &str,
        name: Option<&str>,
        arguments: &str,
    ) -> ToolCallDelta {
        let builder = self.builder(id);
        if let Some(name) = name.filter(|name| !name.is_empty()) {
            builder.name = name.to_string();
        }
        builder.arguments.push_str(arguments);

        ToolCallDelta {
            id: id.to_string(),
            name: name.map(str::to_string),
            arguments: arguments.to_string(),
        }
    }

    pub fn complete_call(&mut self, id: &str) {
        if let Some(index) = self.index_by_id.get(id) {
            self.calls[*index].complete = true;
        }
    }

    pub fn complete_all(&mut self) {
        for call in &mut self.calls {
            call.complete = true;
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.calls.is_empty()
    }

    pub fn finish(self) -> Message {
        let tool_calls = self
            .calls
            .into_iter()
            .filter_map(|call| {
                if !call.complete || call.name.is_empty() {
                    warn!(call_id = %call.id, "dropping incomplete tool call from stream");
                    return None;
                }
                Some(ToolCallRequest {
                    arguments: parse_arguments(&call.id, &call.arguments),
                    id: call.id,
                    tool_name: call.name,
                })
            })
            .collect();

        Message::assistant(self.text, tool_calls)
    }
}

/// Decodes accumulated argument text; unparseable text is kept verbatim as a
/// JSON string so the call can be rejected with a tool-level error.
pub fn parse_arguments(call_id: &str, raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|e| {
        debug!(call_id, error = %e, "tool call arguments are not valid JSON");
        Value::String(raw.to_string())
    })
}

/// A single model invocation as a finite sequence of events.
///
/// The sequence always ends with exactly one terminal event: a provider that
/// fails to open yields a lone `Error`, and a provider stream that ends
/// without `Completed` gets a trailing `Error` appended.
pub struct ModelStream {
    inner: Option<ProviderStream>,
}

impl ModelStream {
    pub async fn open(
        provider: &dyn Provider,
        request: StreamRequest,
        token: CancellationToken,
    ) -> Self {
        match provider.stream(request, token).await {
            Ok(inner) => Self::from_stream(inner),
            Err(err) => {
                warn!(provider = provider.name(), error = %err, "failed to open model stream");
                Self::failed(StreamError::from(&err))
            }
        }
    }

    pub fn from_stream(inner: ProviderStream) -> Self {
        Self { inner: Some(inner) }
    }

    pub fn failed(error: StreamError) -> Self {
        Self::from_stream(Box::pin(stream::once(async move {
            StreamEvent::Error(error)
        })))
    }
}

impl Stream for ModelStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    this.inner = None;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.inner = None;
                Poll::Ready(Some(StreamEvent::Error(StreamError::new(
                    StreamErrorKind::MalformedStream,
                    "model stream ended before completion",
                ))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
