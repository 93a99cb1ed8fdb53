//! Token estimates. Deliberately pessimistic: no tokenizer, just the larger of
//! a word-based and a character-based guess, so the result is an upper bound
//! for typical English text and JSON.

use crate::types::Message;

/// Per-message framing overhead (role tag, separators).
const MESSAGE_OVERHEAD: u32 = 4;

pub fn estimate_text_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let words = text.split_whitespace().count() as u32;
    let chars = text.chars().count() as u32;
    (words * 4).div_ceil(3).max(chars.div_ceil(4))
}

pub fn estimate_message_tokens(message: &Message) -> u32 {
    let mut tokens = MESSAGE_OVERHEAD + estimate_text_tokens(&message.content);
    if !message.tool_calls.is_empty() {
        let payload = serde_json::to_string(&message.tool_calls).unwrap_or_default();
        tokens += estimate_text_tokens(&payload);
    }
    tokens
}

pub fn estimate_summary_tokens(summary: &str) -> u32 {
    (summary.chars().count() as u32).div_ceil(4)
}

pub fn estimate_total(summary: &str, messages: &[Message]) -> u32 {
    estimate_summary_tokens(summary) + messages.iter().map(estimate_message_tokens).sum::<u32>()
}
