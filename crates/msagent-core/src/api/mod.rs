pub mod anthropic;
pub mod error;
pub mod factory;
pub mod gemini;
pub mod openai;
pub mod provider;
pub mod sse;
pub mod stream;
pub mod util;

pub use error::{ApiError, StreamError, StreamErrorKind};
pub use factory::create_provider;
pub use provider::{Provider, ProviderStream, StreamEvent, StreamRequest, ToolCallDelta};
pub use stream::{ModelStream, StreamAssembler};
