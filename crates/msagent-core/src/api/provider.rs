use async_trait::async_trait;
use futures_core::Stream;
use std::fmt::Debug;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use crate::api::error::{ApiError, StreamError};
use crate::app::conversation::Message;
use crate::tools::ToolDescriptor;

/// Everything a provider needs to open one model stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDescriptor>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A fragment of a tool call as it streams in, keyed by call id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub id: String,
    pub name: Option<String>,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ToolCallDelta(ToolCallDelta),
    /// The final assistant message with fully assembled tool calls.
    Completed(Message),
    Error(StreamError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Completed(_) | StreamEvent::Error(_))
    }
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// A streaming chat-completion backend.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Sends the request and returns the event stream once the response
    /// headers have arrived. The stream ends after its first terminal event.
    async fn stream(
        &self,
        request: StreamRequest,
        token: CancellationToken,
    ) -> Result<ProviderStream, ApiError>;
}

impl Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Provider({})", self.name())
    }
}
