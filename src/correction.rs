//! Steering messages appended after a failed model reply. Each helper adds
//! an internal assistant message acknowledging what went wrong and a system
//! instruction telling the model what to do next.

use crate::context::ConversationManager;
use crate::normalize::repair::excerpt;
use crate::normalize::EMPTY_RESPONSE_SENTINEL;
use crate::types::{Message, NormalizedResponse};

fn push_pair(conv: &mut ConversationManager, assistant: String, system: String) {
    conv.add_message(Message::assistant(assistant).internal());
    conv.add_message(Message::system(system).internal());
}

fn describe_rejected(response: &NormalizedResponse) -> String {
    if let Some(bad) = &response.parse_excerpt {
        return format!("a reply containing malformed tool call JSON: {bad}");
    }
    let content = response.content.trim();
    if content.is_empty() || content == EMPTY_RESPONSE_SENTINEL {
        "an empty reply".into()
    } else {
        format!("a reply that could not be used: {}", excerpt(content))
    }
}

pub fn add_parse_error_correction(conv: &mut ConversationManager, response: &NormalizedResponse) {
    push_pair(
        conv,
        format!("(My previous attempt produced {}.)", describe_rejected(response)),
        "Your previous response could not be processed. Answer again. Either reply in plain \
         text, or call a tool through the function-calling interface with a single valid JSON \
         object as its arguments."
            .into(),
    );
}

pub fn add_tool_call_failure_correction(conv: &mut ConversationManager, failed_tool: Option<&str>) {
    let (assistant, system) = match failed_tool {
        Some(tool) => (
            format!("(My call to the {tool} tool was malformed and was rejected.)"),
            format!(
                "The call to {tool} failed to parse. If you still need it, call {tool} again with \
                 arguments that are one JSON object matching its schema, including the \
                 justification field. Do not wrap the call in text or code fences."
            ),
        ),
        None => (
            "(My tool call was malformed and was rejected.)".to_string(),
            "Your tool call failed to parse. Call tools only through the function-calling \
             interface, with arguments that are one JSON object matching the tool's schema."
                .to_string(),
        ),
    };
    push_pair(conv, assistant, system);
}

pub fn add_tools_disabled_instruction(conv: &mut ConversationManager) {
    push_pair(
        conv,
        "(I could not produce a valid tool call.)".into(),
        "Tools are disabled for this reply. Do not attempt any tool call. Answer the user \
         directly in plain language with what you know, and say what you could not do."
            .into(),
    );
}

pub fn add_tool_limit_notice(conv: &mut ConversationManager, reason: &str) {
    push_pair(
        conv,
        format!("(I have to stop using tools for this request: {reason}.)"),
        "The task is ending. Do not call any more tools. Explain to the user what was \
         completed, what failed, and what they can try next."
            .into(),
    );
}
