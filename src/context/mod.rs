//! Tiered conversation state: a rolling summary of old history, the active
//! window sent verbatim, and a side buffer for tool outputs too large to
//! inline.

pub mod compaction;
pub mod sanitize;
pub mod tokens;

use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::CompactionConfig;
use crate::error::AgentError;
use crate::inference::InferenceProvider;
use crate::normalize::normalize;
use crate::session::{ConversationKey, ConversationStore};
use crate::types::{InferenceRequest, Message, Role};

pub use sanitize::SanitizeReport;

pub const SCHEMA_VERSION: u32 = 2;

/// Invoked synchronously after every mutation of the conversation.
pub type StateHook = Box<dyn Fn(&ConversationState) + Send + Sync>;

fn current_version() -> u32 {
    SCHEMA_VERSION
}

/// Serializable conversation state; this is exactly what gets persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    #[serde(default)]
    pub rolling_summary: String,
    #[serde(default)]
    pub active_messages: Vec<Message>,
    #[serde(default)]
    pub tool_output_buffer: BTreeMap<String, String>,
    #[serde(default)]
    pub session_tokens: u32,
    #[serde(default = "current_version")]
    pub schema_version: u32,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self {
            rolling_summary: String::new(),
            active_messages: Vec::new(),
            tool_output_buffer: BTreeMap::new(),
            session_tokens: 0,
            schema_version: SCHEMA_VERSION,
        }
    }
}

impl ConversationState {
    /// Decode stored state, migrating the pre-tiered format (a bare message
    /// array, or an object with `messages` and no current version tag) by
    /// treating every stored message as active.
    pub fn from_stored(value: Value) -> Result<Self, AgentError> {
        let decode = |e: serde_json::Error| AgentError::Context(format!("bad stored state: {e}"));

        let version = value
            .get("schema_version")
            .or_else(|| value.get("schemaVersion"))
            .and_then(Value::as_u64);

        let legacy_messages = match &value {
            Value::Array(_) => Some(value.clone()),
            Value::Object(map) if version.unwrap_or(1) < SCHEMA_VERSION as u64 => {
                map.get("messages").cloned()
            }
            _ => None,
        };

        if let Some(messages) = legacy_messages {
            let active_messages: Vec<Message> = serde_json::from_value(messages).map_err(decode)?;
            info!(messages = active_messages.len(), "migrated legacy conversation state");
            return Ok(Self {
                active_messages,
                ..Self::default()
            });
        }

        let mut state: Self = serde_json::from_value(value).map_err(decode)?;
        state.schema_version = SCHEMA_VERSION;
        Ok(state)
    }
}

/// What [`ConversationManager::compact_history`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionOutcome {
    Compacted,
    /// Under threshold, or no eligible chunk.
    NotNeeded,
    /// The summary request errored or came back empty.
    Failed,
}

/// A line range read back from the tool output buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSlice {
    pub text: String,
    pub start_line: usize,
    pub end_line: usize,
    pub total_lines: usize,
}

/// Owns the message history and everything about what the model sees.
pub struct ConversationManager {
    state: ConversationState,
    config: CompactionConfig,
    on_change: Option<StateHook>,
}

impl ConversationManager {
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            state: ConversationState::default(),
            config,
            on_change: None,
        }
    }

    pub fn with_state_hook(mut self, hook: StateHook) -> Self {
        self.on_change = Some(hook);
        self
    }

    pub fn set_state_hook(&mut self, hook: StateHook) {
        self.on_change = Some(hook);
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    /// Stored messages, without the synthesized summary.
    pub fn active_messages(&self) -> &[Message] {
        &self.state.active_messages
    }

    pub fn rolling_summary(&self) -> &str {
        &self.state.rolling_summary
    }

    pub fn session_tokens(&self) -> u32 {
        self.state.session_tokens
    }

    pub fn max_tokens(&self) -> u32 {
        self.config.max_tokens
    }

    /// Recompute the token estimate and notify the hook.
    fn touch(&mut self) {
        self.state.session_tokens =
            tokens::estimate_total(&self.state.rolling_summary, &self.state.active_messages);
        if let Some(hook) = &self.on_change {
            hook(&self.state);
        }
    }

    pub fn add_message(&mut self, mut message: Message) {
        for call in &mut message.tool_calls {
            if call.kind.is_empty() {
                call.kind = "function".into();
            }
        }
        self.state.active_messages.push(message);
        self.touch();
    }

    /// Install or replace the leading system message.
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        match self.state.active_messages.first_mut() {
            Some(first) if first.role == Role::System => first.content = prompt,
            _ => self.state.active_messages.insert(0, Message::system(prompt)),
        }
        self.touch();
    }

    /// Forget everything: history, summary and buffered outputs.
    pub fn clear(&mut self) {
        self.state = ConversationState::default();
        self.touch();
    }

    /// Outbound message array: active messages with the rolling summary
    /// injected as a system message after any leading system message.
    pub fn get_messages(&self) -> Vec<Message> {
        let mut messages = self.state.active_messages.clone();
        if !self.state.rolling_summary.trim().is_empty() {
            let at = usize::from(messages.first().is_some_and(|m| m.role == Role::System));
            messages.insert(
                at,
                Message::system(format!(
                    "Summary of the earlier conversation:\n{}",
                    self.state.rolling_summary
                )),
            );
        }
        messages
    }

    // --- Compaction ---

    pub fn threshold(&self) -> u32 {
        self.config.threshold()
    }

    pub fn needs_compaction(&self) -> bool {
        self.state.session_tokens > self.threshold()
    }

    /// The oldest chunk eligible for summarization, if any.
    pub fn compaction_chunk(&self) -> Option<Range<usize>> {
        compaction::select_compaction_chunk(&self.state.active_messages, self.config.chunk_size)
    }

    /// Summarization request for the next chunk, when compaction is due.
    pub fn build_compaction_request(
        &self,
        model: &str,
        max_tokens: u32,
    ) -> Option<(Range<usize>, InferenceRequest)> {
        if !self.needs_compaction() {
            return None;
        }
        let chunk = self.compaction_chunk()?;
        let request = compaction::build_compaction_request(
            &self.state.rolling_summary,
            &self.state.active_messages[chunk.clone()],
            model,
            max_tokens,
        );
        Some((chunk, request))
    }

    /// Replace `chunk` with `summary`. Buffered outputs of the removed tool
    /// messages go with them.
    pub fn apply_compaction(&mut self, chunk: Range<usize>, summary: &str) {
        let before = self.state.session_tokens;
        let removed: Vec<Message> = self.state.active_messages.drain(chunk).collect();
        for msg in &removed {
            if let Some(id) = &msg.tool_call_id {
                self.state.tool_output_buffer.remove(id);
            }
        }
        self.state.rolling_summary = summary.trim().to_string();
        self.touch();
        info!(
            removed = removed.len(),
            pre_tokens = before,
            post_tokens = self.state.session_tokens,
            "conversation compacted"
        );
    }

    /// Summarize the oldest chunk through `provider` if over threshold.
    /// A failure leaves the state untouched.
    pub async fn compact_history(
        &mut self,
        provider: &dyn InferenceProvider,
        model: &str,
        max_tokens: u32,
    ) -> CompactionOutcome {
        let Some((chunk, request)) = self.build_compaction_request(model, max_tokens) else {
            return CompactionOutcome::NotNeeded;
        };
        debug!(chunk_start = chunk.start, chunk_end = chunk.end, "requesting summary");

        let raw = match provider.infer(request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "compaction request failed, skipping");
                return CompactionOutcome::Failed;
            }
        };
        let response = normalize(&raw, |_| false);
        let summary = response.display.trim();
        if response.parse_error || summary.is_empty() {
            warn!("compaction returned an empty summary, skipping");
            return CompactionOutcome::Failed;
        }
        let summary = summary.to_string();
        self.apply_compaction(chunk, &summary);
        CompactionOutcome::Compacted
    }

    // --- Sanitization ---

    /// Restore tool-call/response parity in the active window.
    pub fn sanitize(&mut self) -> SanitizeReport {
        let report = sanitize::sanitize_messages(&mut self.state.active_messages);
        if !report.is_clean() {
            self.touch();
        }
        report
    }

    // --- Tool output buffer ---

    pub fn store_tool_output(&mut self, tool_call_id: impl Into<String>, output: impl Into<String>) {
        self.state
            .tool_output_buffer
            .insert(tool_call_id.into(), output.into());
        self.touch();
    }

    pub fn has_tool_output(&self, tool_call_id: &str) -> bool {
        self.state.tool_output_buffer.contains_key(tool_call_id)
    }

    /// Lines `start_line..=end_line` (1-based, clamped) of a buffered output.
    pub fn read_tool_output(
        &self,
        tool_call_id: &str,
        start_line: usize,
        end_line: usize,
    ) -> Option<OutputSlice> {
        let output = self.state.tool_output_buffer.get(tool_call_id)?;
        let lines: Vec<&str> = output.lines().collect();
        let total_lines = lines.len();
        let start = start_line.max(1);
        let end = end_line.min(total_lines);
        let text = if start > end {
            String::new()
        } else {
            lines[start - 1..end].join("\n")
        };
        Some(OutputSlice {
            text,
            start_line: start,
            end_line: end,
            total_lines,
        })
    }

    // --- Persistence ---

    pub fn snapshot(&self) -> ConversationState {
        self.state.clone()
    }

    /// Replace the state wholesale, then repair parity.
    pub fn restore(&mut self, state: ConversationState) {
        self.state = state;
        self.state.schema_version = SCHEMA_VERSION;
        sanitize::sanitize_messages(&mut self.state.active_messages);
        self.touch();
    }

    pub async fn save(
        &self,
        store: &dyn ConversationStore,
        key: &ConversationKey,
    ) -> Result<(), AgentError> {
        let value =
            serde_json::to_value(&self.state).map_err(|e| AgentError::Session(e.to_string()))?;
        store.set(key, value).await
    }

    /// Load stored state for `key`. Returns false when nothing was stored.
    pub async fn load(
        &mut self,
        store: &dyn ConversationStore,
        key: &ConversationKey,
    ) -> Result<bool, AgentError> {
        let Some(value) = store.get(key).await? else {
            return Ok(false);
        };
        let state = ConversationState::from_stored(value)?;
        self.restore(state);
        debug!(
            conversation = %key,
            messages = self.state.active_messages.len(),
            tokens = self.state.session_tokens,
            "conversation loaded"
        );
        Ok(true)
    }
}
