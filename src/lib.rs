//! Tool-calling orchestration for LLM conversations.
//!
//! A [`ConversationEngine`] sends the conversation to a model endpoint,
//! normalizes whatever shape comes back, runs requested tools from a
//! [`ToolRegistry`], feeds results back and repeats until the model answers.
//! The [`ConversationManager`] keeps history inside a token budget by
//! folding old messages into a rolling summary.

mod agent_loop;
pub mod config;
pub mod context;
pub mod correction;
pub mod engine;
pub mod error;
pub mod events;
pub mod inference;
pub mod normalize;
pub mod session;
pub mod tools;
pub mod types;

pub use agent_loop::TOOL_LIMIT_MESSAGE;
pub use config::{CompactionConfig, EngineConfig, RetryConfig};
pub use context::{
    CompactionOutcome, ConversationManager, ConversationState, OutputSlice, StateHook,
};
pub use engine::{
    ConversationEngine, TurnCanceller, TurnOptions, TurnOutcome, TurnStatus, FAILURE_MESSAGE,
};
pub use error::{AgentError, InferenceError, RegistryError, RepairError, ToolError};
pub use events::TurnEvent;
pub use inference::{GeminiProvider, InferenceProvider, OpenAiProvider, RetryingProvider};
pub use normalize::{normalize, normalize_error_body, repair_json};
pub use session::{spawn_persister, ConversationKey, ConversationStore, FileStore, InMemoryStore};
pub use tools::{
    AccessLevel, Caller, Permission, RegisterOptions, Tool, ToolRegistry, ToolStats,
};
pub use types::{
    InferenceRequest, Message, NormalizedResponse, Role, ToolCall, ToolChoice, Usage,
};

pub use tokio_util::sync::CancellationToken;
