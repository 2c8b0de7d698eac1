pub mod error;
pub mod mcp;
pub mod registry;
pub mod schema;
pub mod validation;

pub use error::ToolError;
pub use mcp::{ConnectionOptions, ConnectionState, McpError, ToolServerConnection};
pub use registry::{RegistryWarning, ServerSummary, ToolRegistry};
pub use schema::{ToolCallRequest, ToolDescriptor};
