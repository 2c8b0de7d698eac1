//! Conversation transcript types.
//!
//! A [`ConversationState`] is an append-only list of [`Message`]s that always
//! satisfies the tool pairing rule: every `tool` message answers a call made by
//! the most recent `assistant` message, and no other message may be appended
//! while that assistant still has unanswered calls.

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;

use crate::tools::ToolCallRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversationError {
    #[error("tool result for {tool_call_id} does not answer the preceding assistant message")]
    OrphanedToolResult { tool_call_id: String },

    #[error("tool result for {0} was already recorded")]
    DuplicateToolResult(String),

    #[error("tool call id {0} appears more than once in one assistant message")]
    DuplicateToolCall(String),

    #[error("tool message is missing tool_call_id")]
    MissingToolCallId,

    #[error("only assistant messages may carry tool calls")]
    UnexpectedToolCalls,

    #[error("tool_call_id is only valid on tool messages")]
    UnexpectedToolCallId,

    #[error("{} tool call(s) still awaiting results: {}", .0.len(), .0.join(", "))]
    PendingToolCalls(Vec<String>),
}

fn duplicate_call_id(calls: &[ToolCallRequest]) -> Option<&str> {
    calls.iter().enumerate().find_map(|(i, call)| {
        calls[..i]
            .iter()
            .any(|earlier| earlier.id == call.id)
            .then_some(call.id.as_str())
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationState {
    messages: Vec<Message>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a transcript, checking the pairing rule message by message.
    pub fn from_messages(messages: Vec<Message>) -> Result<Self, ConversationError> {
        let mut state = Self::new();
        for message in messages {
            state.push(message)?;
        }
        Ok(state)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Appends a message if doing so keeps the transcript well formed.
    pub fn push(&mut self, message: Message) -> Result<(), ConversationError> {
        if message.role != Role::Assistant && message.has_tool_calls() {
            return Err(ConversationError::UnexpectedToolCalls);
        }

        match message.role {
            Role::Tool => self.check_tool_result(&message)?,
            Role::User | Role::Assistant => {
                if message.tool_call_id.is_some() {
                    return Err(ConversationError::UnexpectedToolCallId);
                }
                if let Some(id) = duplicate_call_id(&message.tool_calls) {
                    return Err(ConversationError::DuplicateToolCall(id.to_string()));
                }
                let pending = self.pending_tool_calls();
                if !pending.is_empty() {
                    return Err(ConversationError::PendingToolCalls(
                        pending.into_iter().map(|call| call.id.clone()).collect(),
                    ));
                }
            }
        }

        self.messages.push(message);
        Ok(())
    }

    fn check_tool_result(&self, message: &Message) -> Result<(), ConversationError> {
        let call_id = message
            .tool_call_id
            .as_deref()
            .ok_or(ConversationError::MissingToolCallId)?;

        let (assistant, answered) = self.trailing_tool_exchange().ok_or_else(|| {
            ConversationError::OrphanedToolResult {
                tool_call_id: call_id.to_string(),
            }
        })?;

        if !assistant.tool_calls.iter().any(|call| call.id == call_id) {
            return Err(ConversationError::OrphanedToolResult {
                tool_call_id: call_id.to_string(),
            });
        }
        if answered
            .iter()
            .any(|result| result.tool_call_id.as_deref() == Some(call_id))
        {
            return Err(ConversationError::DuplicateToolResult(call_id.to_string()));
        }
        Ok(())
    }

    /// The last assistant message and the tool results recorded after it, when
    /// nothing else follows that assistant message.
    fn trailing_tool_exchange(&self) -> Option<(&Message, &[Message])> {
        let index = self
            .messages
            .iter()
            .rposition(|message| message.role != Role::Tool)?;
        let assistant = &self.messages[index];
        (assistant.role == Role::Assistant).then(|| (assistant, &self.messages[index + 1..]))
    }

    /// Calls of the last assistant message that have no result yet.
    pub fn pending_tool_calls(&self) -> Vec<&ToolCallRequest> {
        let Some((assistant, answered)) = self.trailing_tool_exchange() else {
            return Vec::new();
        };
        assistant
            .tool_calls
            .iter()
            .filter(|call| {
                !answered
                    .iter()
                    .any(|result| result.tool_call_id.as_deref() == Some(call.id.as_str()))
            })
            .collect()
    }
}
