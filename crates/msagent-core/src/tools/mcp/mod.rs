mod connection;
mod error;
pub mod protocol;

pub use connection::{ConnectionOptions, ConnectionState, ToolServerConnection};
pub use error::McpError;
