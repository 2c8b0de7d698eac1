use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool advertised by a connected server, as presented to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: Value,
}

/// A fully assembled tool invocation requested by the model.
///
/// `arguments` holds the decoded JSON arguments. When the model streamed text
/// that does not parse as JSON, the raw text is kept as a JSON string so the
/// call can still be answered with an `invalid_arguments` result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub tool_name: String,
    pub arguments: Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}
