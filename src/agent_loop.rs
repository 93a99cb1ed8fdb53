//! The agentic loop: execute requested tools, feed results back, repeat until
//! the model answers without tools or a limit ends the turn.

use std::collections::HashMap;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::context::{CompactionOutcome, ConversationManager};
use crate::correction;
use crate::engine::TurnStatus;
use crate::error::{AgentError, InferenceError};
use crate::events::TurnEvent;
use crate::inference::InferenceProvider;
use crate::normalize::{normalize, normalize_error_body};
use crate::tools::registry::{strip_justification, READ_TOOL_OUTPUT};
use crate::tools::{is_soft_error, Caller, ToolRegistry};
use crate::types::{InferenceRequest, Message, NormalizedResponse, ToolCall, ToolChoice, Usage};

/// Returned in place of a model answer when the loop is forced to stop.
pub const TOOL_LIMIT_MESSAGE: &str =
    "I had to stop working on this request because my tool calls kept failing or repeating. \
     Please review what was completed so far, rephrase, or try again.";

/// Everything one turn needs, borrowed from the engine for its duration.
pub(crate) struct TurnContext<'a> {
    pub provider: &'a dyn InferenceProvider,
    pub registry: &'a mut ToolRegistry,
    pub conversation: &'a mut ConversationManager,
    pub config: &'a EngineConfig,
    pub caller: &'a Caller,
    pub cancel: &'a CancellationToken,
    pub events: Option<&'a mpsc::Sender<TurnEvent>>,
    pub usage: Usage,
    /// Set once a summary request fails; compaction is off for the rest of the turn.
    pub compaction_failed: bool,
}

impl TurnContext<'_> {
    pub async fn emit(&self, event: TurnEvent) {
        if let Some(tx) = self.events {
            let _ = tx.send(event).await;
        }
    }

    pub fn check_cancelled(&self) -> Result<(), AgentError> {
        if self.cancel.is_cancelled() {
            info!("turn cancelled");
            return Err(AgentError::Cancelled);
        }
        Ok(())
    }

    fn is_known_tool(&self, name: &str) -> bool {
        if name == READ_TOOL_OUTPUT {
            return self.config.enable_tool_output_reader;
        }
        self.registry.get(name).is_some_and(|t| t.enabled)
    }

    fn tool_schemas(&self) -> Vec<Value> {
        let mut tools = self.registry.get_tool_schemas();
        if self.config.enable_tool_output_reader
            && !self.conversation.state().tool_output_buffer.is_empty()
        {
            tools.push(ToolRegistry::read_tool_output_schema());
        }
        tools
    }

    /// Send the current conversation to the model and normalize the reply.
    /// A provider error body describing a malformed tool call is turned into
    /// a normalized failure instead of an error.
    pub async fn request_model(&mut self, tools_enabled: bool) -> Result<NormalizedResponse, AgentError> {
        self.check_cancelled()?;
        let (tools, tool_choice) = if tools_enabled {
            (self.tool_schemas(), ToolChoice::Auto)
        } else {
            (Vec::new(), ToolChoice::None)
        };
        let request = InferenceRequest {
            model: self.config.model.clone(),
            messages: self.conversation.get_messages(),
            max_tokens: self.config.max_output_tokens,
            temperature: self.config.temperature,
            tools,
            tool_choice,
        };
        debug!(
            messages = request.messages.len(),
            tools = request.tools.len(),
            tokens = self.conversation.session_tokens(),
            "requesting model"
        );

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                info!("turn cancelled during inference");
                return Err(AgentError::Cancelled);
            }
            r = self.provider.infer(request) => r,
        };

        let response = match result {
            Ok(raw) => normalize(&raw, |name| self.is_known_tool(name)),
            Err(InferenceError::ApiError { status, body }) => {
                match normalize_error_body(status, &body, |name| self.is_known_tool(name)) {
                    Some(response) => response,
                    None => return Err(InferenceError::ApiError { status, body }.into()),
                }
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(usage) = &response.usage {
            self.usage.accumulate(usage);
        }
        Ok(response)
    }

    /// Fold the oldest chunk into the rolling summary if over budget.
    pub async fn maybe_compact(&mut self) -> Result<(), AgentError> {
        if self.compaction_failed || !self.conversation.needs_compaction() {
            return Ok(());
        }
        let pre_tokens = self.conversation.session_tokens();
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
            outcome = self.conversation.compact_history(
                self.provider,
                &self.config.model,
                self.config.max_output_tokens,
            ) => outcome,
        };
        match outcome {
            CompactionOutcome::Compacted => {
                let post_tokens = self.conversation.session_tokens();
                self.emit(TurnEvent::Compacted { pre_tokens, post_tokens }).await;
            }
            CompactionOutcome::Failed => {
                info!("compaction skipped for the rest of this turn");
                self.compaction_failed = true;
            }
            CompactionOutcome::NotNeeded => {}
        }
        Ok(())
    }

    /// Append the model's reply to history and surface its display text.
    pub async fn record_reply(&mut self, response: &NormalizedResponse) {
        let message = Message::assistant_with_tools(response.display.clone(), response.tool_calls.clone())
            .with_metadata(response.provider_metadata.clone());
        self.conversation.add_message(message);
        if !response.display.trim().is_empty() {
            self.emit(TurnEvent::AssistantMessage {
                content: response.display.clone(),
            })
            .await;
        }
    }
}

/// How the loop ended.
#[derive(Debug)]
pub(crate) struct LoopOutcome {
    pub response: NormalizedResponse,
    pub status: TurnStatus,
    pub iterations: u32,
    pub repeats: u32,
}

enum LoopState {
    AwaitModel,
    ParseErrorRetry(NormalizedResponse),
    ToolFailureFallback(NormalizedResponse),
    ExecuteTools(Vec<ToolCall>),
    Done(NormalizedResponse),
    LimitReached { status: TurnStatus, reason: String },
}

/// Result of one tool call, as recorded in history.
struct CallResult {
    content: String,
    failed: bool,
}

/// Drive tool execution starting from `calls`, which the engine has already
/// recorded as an assistant message.
pub(crate) async fn run_tool_loop(
    ctx: &mut TurnContext<'_>,
    calls: Vec<ToolCall>,
) -> Result<LoopOutcome, AgentError> {
    let max_repeats = ctx.config.max_tool_repeats;
    let mut repeats: u32 = 0;
    let mut iterations: u32 = 0;
    // Successful executions per canonical call signature.
    let mut seen: HashMap<String, u32> = HashMap::new();
    let mut state = LoopState::ExecuteTools(calls);

    loop {
        ctx.check_cancelled()?;
        state = match state {
            LoopState::ExecuteTools(calls) => {
                iterations += 1;
                if iterations > ctx.config.max_iterations {
                    let reason = format!("the {} iteration limit was reached", ctx.config.max_iterations);
                    skip_calls(ctx, &calls, &reason).await;
                    LoopState::LimitReached {
                        status: TurnStatus::LoopGuardTripped,
                        reason,
                    }
                } else {
                    execute_batch(ctx, calls, &mut seen, &mut repeats).await?
                }
            }

            LoopState::AwaitModel => {
                ctx.maybe_compact().await?;
                let response = ctx.request_model(true).await?;
                if response.parse_error {
                    LoopState::ParseErrorRetry(response)
                } else if response.tool_call_failure {
                    LoopState::ToolFailureFallback(response)
                } else {
                    ctx.record_reply(&response).await;
                    if response.has_tool_calls() {
                        LoopState::ExecuteTools(response.tool_calls.clone())
                    } else {
                        LoopState::Done(response)
                    }
                }
            }

            LoopState::ParseErrorRetry(response) => {
                repeats += 1;
                warn!(repeats, excerpt = ?response.parse_excerpt, "unparseable reply inside tool loop");
                if repeats >= max_repeats {
                    LoopState::LimitReached {
                        status: TurnStatus::ToolLimitReached,
                        reason: "too many failed attempts".into(),
                    }
                } else {
                    correction::add_parse_error_correction(ctx.conversation, &response);
                    ctx.emit(TurnEvent::Correction {
                        reason: "parse_error".into(),
                    })
                    .await;
                    LoopState::AwaitModel
                }
            }

            LoopState::ToolFailureFallback(response) => {
                repeats += 1;
                warn!(repeats, tool = ?response.failed_tool, "malformed tool call inside tool loop");
                if repeats >= max_repeats {
                    LoopState::LimitReached {
                        status: TurnStatus::ToolLimitReached,
                        reason: "too many malformed tool calls".into(),
                    }
                } else {
                    correction::add_tool_call_failure_correction(
                        ctx.conversation,
                        response.failed_tool.as_deref(),
                    );
                    ctx.emit(TurnEvent::Correction {
                        reason: "tool_call_failure".into(),
                    })
                    .await;
                    LoopState::AwaitModel
                }
            }

            LoopState::Done(response) => {
                info!(iterations, repeats, "tool loop finished");
                return Ok(LoopOutcome {
                    response,
                    status: TurnStatus::Completed,
                    iterations,
                    repeats,
                });
            }

            LoopState::LimitReached { status, reason } => {
                warn!(iterations, repeats, reason = %reason, "tool loop stopped");
                correction::add_tool_limit_notice(ctx.conversation, &reason);
                return Ok(LoopOutcome {
                    response: NormalizedResponse::text(TOOL_LIMIT_MESSAGE),
                    status,
                    iterations,
                    repeats,
                });
            }
        };
    }
}

/// Canonical identity of a call for the loop guard: name plus arguments
/// without the justification. Object keys serialize sorted.
fn call_signature(call: &ToolCall) -> String {
    let (args, _) = strip_justification(&call.arguments);
    format!("{}:{}", call.name, args)
}

async fn execute_batch(
    ctx: &mut TurnContext<'_>,
    calls: Vec<ToolCall>,
    seen: &mut HashMap<String, u32>,
    repeats: &mut u32,
) -> Result<LoopState, AgentError> {
    let mut any_failed = false;

    for (i, call) in calls.iter().enumerate() {
        ctx.check_cancelled()?;

        let signature = call_signature(call);
        let prior = seen.get(&signature).copied().unwrap_or(0);
        if prior >= ctx.config.max_identical_calls {
            warn!(tool = %call.name, prior, "identical tool call repeated, stopping");
            let reason = format!(
                "{} was already called with these arguments {} times this turn",
                call.name, prior
            );
            skip_calls(ctx, &calls[i..], &reason).await;
            return Ok(LoopState::LimitReached {
                status: TurnStatus::LoopGuardTripped,
                reason,
            });
        }

        ctx.emit(TurnEvent::ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        })
        .await;

        let result = execute_call(ctx, call).await?;
        let content = inline_output(ctx, &call.id, result.content);

        ctx.conversation
            .add_message(Message::tool_result(call.id.clone(), content.clone()));
        ctx.emit(TurnEvent::ToolResult {
            id: call.id.clone(),
            name: call.name.clone(),
            output: content,
            is_error: result.failed,
        })
        .await;

        if result.failed {
            any_failed = true;
        } else {
            *seen.entry(signature).or_insert(0) += 1;
        }
    }

    if any_failed {
        *repeats += 1;
        warn!(repeats = *repeats, "tool batch had failures");
        if *repeats >= ctx.config.max_tool_repeats {
            return Ok(LoopState::LimitReached {
                status: TurnStatus::ToolLimitReached,
                reason: "too many failed tool calls".into(),
            });
        }
    }
    Ok(LoopState::AwaitModel)
}

/// Answer calls that will not run, so every call still has a result.
async fn skip_calls(ctx: &mut TurnContext<'_>, calls: &[ToolCall], reason: &str) {
    for call in calls {
        let content = json!({ "error": format!("Skipped: {reason}") }).to_string();
        ctx.conversation
            .add_message(Message::tool_result(call.id.clone(), content.clone()));
        ctx.emit(TurnEvent::ToolResult {
            id: call.id.clone(),
            name: call.name.clone(),
            output: content,
            is_error: true,
        })
        .await;
    }
}

async fn execute_call(ctx: &mut TurnContext<'_>, call: &ToolCall) -> Result<CallResult, AgentError> {
    if call.name == READ_TOOL_OUTPUT && ctx.config.enable_tool_output_reader {
        return Ok(read_buffered_output(ctx, &call.arguments));
    }

    let cancel = ctx.cancel;
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            info!(tool = %call.name, "turn cancelled during tool execution");
            return Err(AgentError::Cancelled);
        }
        r = ctx.registry.execute_tool(&call.name, &call.arguments, ctx.caller) => r,
    };

    Ok(match outcome {
        Ok(output) => CallResult {
            failed: is_soft_error(&output),
            content: match output {
                Value::String(s) => s,
                other => other.to_string(),
            },
        },
        Err(e) => CallResult {
            content: json!({ "error": e.to_string() }).to_string(),
            failed: true,
        },
    })
}

fn read_buffered_output(ctx: &TurnContext<'_>, args: &Value) -> CallResult {
    let id = args.get("tool_call_id").and_then(Value::as_str);
    let start = args.get("start_line").and_then(Value::as_u64).unwrap_or(1) as usize;
    let end = args
        .get("end_line")
        .and_then(Value::as_u64)
        .map_or(usize::MAX, |n| n as usize);

    let slice = id.and_then(|id| ctx.conversation.read_tool_output(id, start, end));
    match slice {
        Some(slice) => CallResult {
            content: format!(
                "Lines {}-{} of {}:\n{}",
                slice.start_line, slice.end_line, slice.total_lines, slice.text
            ),
            failed: false,
        },
        None => CallResult {
            content: json!({
                "error": format!("No buffered output for tool_call_id {}", id.unwrap_or("(missing)"))
            })
            .to_string(),
            failed: true,
        },
    }
}

/// Keep oversized outputs out of the active window: store them whole and
/// inline a preview with directions for reading the rest.
fn inline_output(ctx: &mut TurnContext<'_>, call_id: &str, content: String) -> String {
    let limit = ctx.config.tool_output_inline_limit;
    if !ctx.config.enable_tool_output_reader || content.chars().count() <= limit {
        return content;
    }

    let total_lines = content.lines().count();
    let mut preview = String::new();
    for line in content.lines() {
        if preview.chars().count() + line.chars().count() + 1 > limit / 2 {
            break;
        }
        preview.push_str(line);
        preview.push('\n');
    }
    if preview.is_empty() {
        preview = content.chars().take(limit / 2).collect();
        preview.push('\n');
    }
    let shown = preview.lines().count();

    ctx.conversation.store_tool_output(call_id, content);
    debug!(tool_call_id = %call_id, total_lines, "tool output buffered");
    format!(
        "{preview}[Output truncated: showing {shown} of {total_lines} lines. Call {READ_TOOL_OUTPUT} \
         with tool_call_id \"{call_id}\" and a line range to read more.]"
    )
}
