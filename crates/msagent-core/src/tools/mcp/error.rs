use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum McpError {
    #[error("Cannot connect to {server_name}: {message}")]
    ConnectionFailed {
        server_name: String,
        message: String,
    },

    #[error("Protocol error from {server_name}: {message}")]
    Protocol {
        server_name: String,
        message: String,
    },

    #[error("{server_name} returned JSON-RPC error {code}: {message}")]
    Rpc {
        server_name: String,
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Tool {tool_name} on {server_name} reported an error: {payload}")]
    ToolExecution {
        server_name: String,
        tool_name: String,
        payload: String,
    },

    #[error("Timeout waiting for {method} response from {server_name}")]
    Timeout { server_name: String, method: String },

    #[error("Connection to {server_name} was lost")]
    ConnectionLost { server_name: String },

    #[error("Connection to {server_name} is closed")]
    Closed { server_name: String },

    #[error("I/O error talking to {server_name}: {message}")]
    Io {
        server_name: String,
        message: String,
    },
}

impl McpError {
    pub fn server_name(&self) -> &str {
        match self {
            McpError::ConnectionFailed { server_name, .. }
            | McpError::Protocol { server_name, .. }
            | McpError::Rpc { server_name, .. }
            | McpError::ToolExecution { server_name, .. }
            | McpError::Timeout { server_name, .. }
            | McpError::ConnectionLost { server_name }
            | McpError::Closed { server_name }
            | McpError::Io { server_name, .. } => server_name,
        }
    }
}
