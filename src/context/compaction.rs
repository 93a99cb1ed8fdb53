use std::collections::HashSet;
use std::ops::Range;

use crate::types::{InferenceRequest, Message, Role, ToolChoice};

const COMPACTION_PROMPT: &str = "\
You maintain a running summary of a conversation between a user and an assistant \
that uses tools. Fold the new messages into the existing summary and return only \
the updated summary.

Keep: what the user asked for, decisions made, facts learned from tool results \
(names, ids, numbers), errors and how they were resolved, and anything still pending. \
Drop pleasantries and restated content. Write plain prose or short bullet points.";

/// Oldest chunk eligible for summarization: `chunk_size` messages after a
/// leading system message, extended so no tool-call group is split. `None`
/// when the chunk would consume every remaining message.
pub fn select_compaction_chunk(messages: &[Message], chunk_size: usize) -> Option<Range<usize>> {
    let start = usize::from(messages.first().is_some_and(|m| m.role == Role::System));
    let end = (start + chunk_size.max(1)).min(messages.len());
    let end = adjust_chunk_end(messages, start, end);
    (end > start && end < messages.len()).then_some(start..end)
}

/// Move `end` forward until the chunk `start..end` holds every tool response
/// belonging to an assistant message inside it, and does not stop in front
/// of a tool message. Returns `end` unchanged for a boundary that is
/// already valid.
pub fn adjust_chunk_end(messages: &[Message], start: usize, end: usize) -> usize {
    let mut end = end.min(messages.len());
    loop {
        let before = end;

        while end < messages.len() && messages[end].role == Role::Tool {
            end += 1;
        }

        let ids: HashSet<&str> = messages[start..end]
            .iter()
            .flat_map(|m| m.tool_calls.iter().map(|c| c.id.as_str()))
            .collect();
        if let Some(last) = messages[end..].iter().rposition(|m| {
            m.role == Role::Tool && m.tool_call_id.as_deref().is_some_and(|id| ids.contains(id))
        }) {
            end += last + 1;
        }

        if end == before {
            return end;
        }
    }
}

fn render_transcript(chunk: &[Message]) -> String {
    let mut out = String::new();
    for msg in chunk {
        let content = msg.content.trim();
        match msg.role {
            Role::Tool => {
                let id = msg.tool_call_id.as_deref().unwrap_or("?");
                out.push_str(&format!("tool result ({id}): {content}\n"));
            }
            role => {
                if !content.is_empty() {
                    out.push_str(&format!("{}: {content}\n", role.as_str()));
                }
                for call in &msg.tool_calls {
                    out.push_str(&format!(
                        "{} called {} ({}) with {}\n",
                        role.as_str(),
                        call.name,
                        call.id,
                        call.arguments
                    ));
                }
            }
        }
    }
    out
}

/// Request asking the model to fold `chunk` into `summary`. Tools are off.
pub fn build_compaction_request(
    summary: &str,
    chunk: &[Message],
    model: &str,
    max_tokens: u32,
) -> InferenceRequest {
    let existing = if summary.trim().is_empty() {
        "(none yet)"
    } else {
        summary.trim()
    };
    let prompt = format!(
        "Existing summary:\n{existing}\n\nNew messages:\n{}",
        render_transcript(chunk)
    );

    InferenceRequest {
        model: model.to_string(),
        messages: vec![Message::system(COMPACTION_PROMPT), Message::user(prompt)],
        max_tokens,
        temperature: None,
        tools: Vec::new(),
        tool_choice: ToolChoice::None,
    }
}
