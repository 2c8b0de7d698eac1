pub mod agent;
pub mod agent_loop;
pub mod conversation;
pub mod prompts;

pub use agent::{Agent, ServerStartFailure};
pub use agent_loop::{
    AgentLoop, AgentLoopConfig, AgentLoopError, LoopState, TurnEvent, TurnOutcome,
};
pub use conversation::{ConversationError, ConversationState, Message, Role};
