use crate::tools::mcp::McpError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool {tool_name} from {rejected_server} is already provided by {existing_server}")]
    DuplicateTool {
        tool_name: String,
        existing_server: String,
        rejected_server: String,
    },

    #[error("A server named {0} is already registered")]
    DuplicateServer(String),

    #[error("Unknown server: {0}")]
    UnknownServer(String),

    #[error("Invalid arguments for {tool_name}: {message}")]
    InvalidArguments { tool_name: String, message: String },

    #[error("Tool {tool_name} failed: {message}")]
    Execution { tool_name: String, message: String },

    #[error("Tool {tool_name} timed out")]
    Timeout { tool_name: String },

    #[error("Server {server_name} for tool {tool_name} is closed")]
    ConnectionClosed {
        tool_name: String,
        server_name: String,
    },

    #[error("Lost connection to {server_name} while running {tool_name}")]
    ConnectionLost {
        tool_name: String,
        server_name: String,
    },

    #[error("Tool {0} was cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Mcp(#[from] McpError),
}

impl ToolError {
    /// Maps a failed `tools/call` into the error reported for that call.
    pub fn from_call(tool_name: &str, err: McpError) -> Self {
        match err {
            McpError::ToolExecution { payload, .. } => ToolError::Execution {
                tool_name: tool_name.to_string(),
                message: payload,
            },
            McpError::Timeout { .. } => ToolError::Timeout {
                tool_name: tool_name.to_string(),
            },
            McpError::ConnectionLost { server_name } | McpError::Io { server_name, .. } => {
                ToolError::ConnectionLost {
                    tool_name: tool_name.to_string(),
                    server_name,
                }
            }
            McpError::Closed { server_name } => ToolError::ConnectionClosed {
                tool_name: tool_name.to_string(),
                server_name,
            },
            other => ToolError::Mcp(other),
        }
    }

    /// Stable machine-readable classification, used in tool result payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::UnknownTool(_) => "unknown_tool",
            ToolError::DuplicateTool { .. } => "duplicate_tool",
            ToolError::DuplicateServer(_) => "duplicate_server",
            ToolError::UnknownServer(_) => "unknown_server",
            ToolError::InvalidArguments { .. } => "invalid_arguments",
            ToolError::Execution { .. } => "tool_execution",
            ToolError::Timeout { .. } => "timeout",
            ToolError::ConnectionClosed { .. } => "connection_closed",
            ToolError::ConnectionLost { .. } => "connection_lost",
            ToolError::Cancelled(_) => "cancelled",
            ToolError::Mcp(McpError::Protocol { .. }) => "protocol",
            ToolError::Mcp(_) => "server_error",
        }
    }

    /// The tool-result content the model sees for this failure.
    pub fn to_result_content(&self) -> String {
        let message = match self {
            ToolError::Execution { message, .. } => message.clone(),
            other => other.to_string(),
        };
        json!({ "error": { "kind": self.kind(), "message": message } }).to_string()
    }
}

pub type Result<T> = std::result::Result<T, ToolError>;

/// Whether tool-result content is an error payload produced by
/// [`ToolError::to_result_content`].
pub fn is_error_result(content: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(content)
        .ok()
        .and_then(|value| value.get("error")?.get("kind").cloned())
        .is_some_and(|kind| kind.is_string())
}
