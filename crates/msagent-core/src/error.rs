use thiserror::Error;

use crate::api::ApiError;
use crate::app::AgentLoopError;
use crate::app::conversation::ConversationError;
use crate::tools::{McpError, ToolError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Mcp(#[from] McpError),
    #[error(transparent)]
    AgentLoop(#[from] AgentLoopError),
    #[error(transparent)]
    Conversation(#[from] ConversationError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Cancelled")]
    Cancelled,
}
