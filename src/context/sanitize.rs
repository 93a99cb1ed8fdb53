//! Repairs tool-call/response parity in stored history.
//!
//! An assistant message's tool calls are answered by the `tool` messages that
//! follow it up to the next assistant message. Missing answers get an
//! "interrupted" stub placed right after the assistant message; tool messages
//! nobody asked for (or answering an id twice) are dropped.

use std::collections::HashSet;

use serde_json::json;
use tracing::warn;

use crate::types::{Message, Role, ToolCall};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SanitizeReport {
    /// Call ids that received a stub response.
    pub stubbed: Vec<String>,
    /// Orphaned or duplicate tool messages removed.
    pub dropped: usize,
}

impl SanitizeReport {
    pub fn is_clean(&self) -> bool {
        self.stubbed.is_empty() && self.dropped == 0
    }
}

fn interrupted_stub(call: &ToolCall) -> Message {
    let payload = json!({
        "error": format!("Tool execution was interrupted before {} returned a result", call.name),
    });
    Message::tool_result(call.id.clone(), payload.to_string())
}

pub fn sanitize_messages(messages: &mut Vec<Message>) -> SanitizeReport {
    let original = std::mem::take(messages);
    let mut report = SanitizeReport::default();
    let mut open: HashSet<String> = HashSet::new();

    for (i, msg) in original.iter().enumerate() {
        match msg.role {
            Role::Assistant => {
                open.clear();
                messages.push(msg.clone());
                if !msg.has_tool_calls() {
                    continue;
                }
                let answered: HashSet<&str> = original[i + 1..]
                    .iter()
                    .take_while(|m| m.role != Role::Assistant)
                    .filter(|m| m.role == Role::Tool)
                    .filter_map(|m| m.tool_call_id.as_deref())
                    .collect();
                for call in &msg.tool_calls {
                    if answered.contains(call.id.as_str()) && open.insert(call.id.clone()) {
                        continue;
                    }
                    messages.push(interrupted_stub(call));
                    report.stubbed.push(call.id.clone());
                }
            }
            Role::Tool => match msg.tool_call_id.as_deref() {
                Some(id) if open.remove(id) => messages.push(msg.clone()),
                _ => report.dropped += 1,
            },
            Role::System | Role::User => messages.push(msg.clone()),
        }
    }

    if !report.is_clean() {
        warn!(
            stubbed = report.stubbed.len(),
            dropped = report.dropped,
            "repaired tool call parity"
        );
    }
    report
}

/// True when every assistant tool call is answered exactly once before the
/// next assistant message and no tool message is unowned.
pub fn has_parity(messages: &[Message]) -> bool {
    let mut open: HashSet<&str> = HashSet::new();
    for msg in messages {
        match msg.role {
            Role::Assistant => {
                if !open.is_empty() {
                    return false;
                }
                open = msg.tool_calls.iter().map(|c| c.id.as_str()).collect();
            }
            Role::Tool => {
                let owned = msg.tool_call_id.as_deref().is_some_and(|id| open.remove(id));
                if !owned {
                    return false;
                }
            }
            Role::System | Role::User => {}
        }
    }
    open.is_empty()
}
