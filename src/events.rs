use serde_json::Value;

use crate::engine::TurnStatus;

/// Events emitted while a turn runs, in order, for UI streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// A displayable assistant message.
    AssistantMessage { content: String },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    /// A correction pair was appended before re-asking the model.
    Correction { reason: String },
    Compacted { pre_tokens: u32, post_tokens: u32 },
    Finished { status: TurnStatus, iterations: u32 },
}
