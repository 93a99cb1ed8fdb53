use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent_loop::{run_tool_loop, TurnContext};
use crate::config::EngineConfig;
use crate::context::{ConversationManager, StateHook};
use crate::correction;
use crate::error::AgentError;
use crate::events::TurnEvent;
use crate::inference::{InferenceProvider, RetryingProvider};
use crate::session::{ConversationKey, ConversationStore};
use crate::tools::{Caller, RegisterOptions, Tool, ToolRegistry};
use crate::types::{Message, ToolCall, Usage};

/// Returned when the model cannot produce a usable reply.
pub const FAILURE_MESSAGE: &str =
    "I was unable to generate a proper response. Please try rephrasing your request.";

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    /// The model answered without requesting tools.
    Completed,
    /// Every pre-tool attempt produced an unusable reply.
    CorrectionExhausted,
    /// Tool calls kept failing to parse; the tools-disabled request failed too.
    ToolsDisabledFallback,
    /// The agentic loop used up its repeat budget.
    ToolLimitReached,
    /// Identical calls repeated, or the iteration cap was hit.
    LoopGuardTripped,
}

/// Final result of [`ConversationEngine::process_turn`].
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub content: String,
    /// Always empty once a turn has finished.
    pub tool_calls: Vec<ToolCall>,
    pub model: Option<String>,
    pub usage: Usage,
    pub status: TurnStatus,
    /// Tool batches executed.
    pub iterations: u32,
    /// Repeat increments recorded by the agentic loop.
    pub repeats: u32,
}

impl TurnOutcome {
    fn failure(status: TurnStatus, usage: Usage) -> Self {
        Self {
            content: FAILURE_MESSAGE.into(),
            tool_calls: Vec::new(),
            model: None,
            usage,
            status,
            iterations: 0,
            repeats: 0,
        }
    }

    /// True when the agentic loop was forced to stop.
    pub fn tool_limit_reached(&self) -> bool {
        matches!(
            self.status,
            TurnStatus::ToolLimitReached | TurnStatus::LoopGuardTripped
        )
    }
}

/// Per-turn inputs supplied by the host.
pub struct TurnOptions {
    pub caller: Caller,
    pub cancel: Option<CancellationToken>,
    pub events: Option<mpsc::Sender<TurnEvent>>,
}

impl TurnOptions {
    pub fn new(caller: Caller) -> Self {
        Self {
            caller,
            cancel: None,
            events: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<TurnEvent>) -> Self {
        self.events = Some(events);
        self
    }
}

/// Cancels whichever turn is current. Cloneable and usable from other tasks.
#[derive(Clone)]
pub struct TurnCanceller {
    slot: Arc<Mutex<Option<CancellationToken>>>,
}

impl TurnCanceller {
    /// Returns whether a turn was running.
    pub fn cancel_current(&self) -> bool {
        let Ok(slot) = self.slot.lock() else {
            return false;
        };
        match slot.as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// Owns one conversation: provider, tools, context and the current turn.
pub struct ConversationEngine {
    provider: Box<dyn InferenceProvider>,
    registry: ToolRegistry,
    conversation: ConversationManager,
    config: EngineConfig,
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl ConversationEngine {
    pub fn new(
        provider: impl InferenceProvider + 'static,
        registry: ToolRegistry,
        config: EngineConfig,
    ) -> Self {
        let mut conversation = ConversationManager::new(config.compaction.clone());
        if let Some(prompt) = &config.system_prompt {
            conversation.set_system_prompt(prompt.clone());
        }
        Self {
            provider: Box::new(provider),
            registry,
            conversation,
            config,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Like [`ConversationEngine::new`], with `provider` wrapped in a
    /// [`RetryingProvider`] built from `config.retry`. `new` uses the
    /// provider as given and ignores `config.retry`.
    pub fn with_retries(
        provider: impl InferenceProvider + 'static,
        registry: ToolRegistry,
        config: EngineConfig,
    ) -> Self {
        let provider = RetryingProvider::new(provider, &config.retry);
        Self::new(provider, registry, config)
    }

    /// Register a tool on a running engine; it is offered from the next request.
    pub fn register_tool(
        &mut self,
        tool: impl Tool + 'static,
        options: RegisterOptions,
    ) -> Result<(), AgentError> {
        self.registry.register_tool(tool, options)?;
        Ok(())
    }

    /// Install a callback run after every conversation state change.
    pub fn with_state_hook(mut self, hook: StateHook) -> Self {
        self.conversation.set_state_hook(hook);
        self
    }

    pub fn conversation(&self) -> &ConversationManager {
        &self.conversation
    }

    pub fn conversation_mut(&mut self) -> &mut ConversationManager {
        &mut self.conversation
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ToolRegistry {
        &mut self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn canceller(&self) -> TurnCanceller {
        TurnCanceller {
            slot: Arc::clone(&self.current),
        }
    }

    /// Load a stored conversation. A stored system prompt is replaced by the
    /// configured one.
    pub async fn load(
        &mut self,
        store: &dyn ConversationStore,
        key: &ConversationKey,
    ) -> Result<bool, AgentError> {
        let found = self.conversation.load(store, key).await?;
        if found {
            if let Some(prompt) = &self.config.system_prompt {
                self.conversation.set_system_prompt(prompt.clone());
            }
        }
        Ok(found)
    }

    pub async fn save(
        &self,
        store: &dyn ConversationStore,
        key: &ConversationKey,
    ) -> Result<(), AgentError> {
        self.conversation.save(store, key).await
    }

    /// Make `token` the current turn, cancelling any previous one.
    fn claim_slot(&self, token: CancellationToken) {
        if let Ok(mut slot) = self.current.lock() {
            if let Some(previous) = slot.replace(token) {
                previous.cancel();
            }
        }
    }

    fn release_slot(&self) {
        if let Ok(mut slot) = self.current.lock() {
            *slot = None;
        }
    }

    /// Run one user turn to completion.
    ///
    /// Parse failures, tool-limit and loop-guard stops come back as `Ok` with
    /// a [`TurnStatus`]; `Err` means cancellation or an unrecoverable
    /// transport failure.
    pub async fn process_turn(
        &mut self,
        user_message: &str,
        options: TurnOptions,
    ) -> Result<TurnOutcome, AgentError> {
        let cancel = options
            .cancel
            .as_ref()
            .map_or_else(CancellationToken::new, CancellationToken::child_token);
        self.claim_slot(cancel.clone());

        let result = self.run_turn(user_message, &options, &cancel).await;
        self.release_slot();

        if let (Some(tx), Ok(outcome)) = (&options.events, &result) {
            let _ = tx
                .send(TurnEvent::Finished {
                    status: outcome.status,
                    iterations: outcome.iterations,
                })
                .await;
        }
        result
    }

    async fn run_turn(
        &mut self,
        user_message: &str,
        options: &TurnOptions,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let mut ctx = TurnContext {
            provider: self.provider.as_ref(),
            registry: &mut self.registry,
            conversation: &mut self.conversation,
            config: &self.config,
            caller: &options.caller,
            cancel,
            events: options.events.as_ref(),
            usage: Usage::default(),
            compaction_failed: false,
        };
        ctx.check_cancelled()?;

        let report = ctx.conversation.sanitize();
        if !report.is_clean() {
            warn!(
                stubbed = report.stubbed.len(),
                dropped = report.dropped,
                "repaired tool call parity before turn"
            );
        }

        ctx.conversation.add_message(Message::user(user_message));
        info!(
            user = %options.caller.user_id,
            tokens = ctx.conversation.session_tokens(),
            "turn started"
        );
        ctx.maybe_compact().await?;

        // --- Pre-tool correction loop ---
        let max_attempts = self.config.max_correction_attempts.max(1);
        let mut attempt = 0;
        let response = loop {
            attempt += 1;
            let response = ctx.request_model(true).await?;
            let reason = if response.parse_error {
                "parse_error"
            } else if response.tool_call_failure {
                "tool_call_failure"
            } else {
                break response;
            };
            warn!(attempt, reason, "model reply rejected");

            if attempt >= max_attempts {
                if response.parse_error {
                    return Ok(finish_with_failure(&mut ctx, TurnStatus::CorrectionExhausted).await);
                }
                return tools_disabled_fallback(&mut ctx).await;
            }

            if response.parse_error {
                correction::add_parse_error_correction(ctx.conversation, &response);
            } else {
                correction::add_tool_call_failure_correction(
                    ctx.conversation,
                    response.failed_tool.as_deref(),
                );
            }
            ctx.emit(TurnEvent::Correction {
                reason: reason.into(),
            })
            .await;
        };

        ctx.record_reply(&response).await;
        if !response.has_tool_calls() {
            info!(attempts = attempt, "turn completed without tools");
            return Ok(TurnOutcome {
                content: response.display,
                tool_calls: Vec::new(),
                model: response.model,
                usage: ctx.usage,
                status: TurnStatus::Completed,
                iterations: 0,
                repeats: 0,
            });
        }

        // --- Agentic loop ---
        let outcome = run_tool_loop(&mut ctx, response.tool_calls.clone()).await?;
        if outcome.status != TurnStatus::Completed {
            ctx.emit(TurnEvent::AssistantMessage {
                content: outcome.response.display.clone(),
            })
            .await;
        }
        Ok(TurnOutcome {
            content: outcome.response.display,
            tool_calls: Vec::new(),
            model: outcome.response.model.or(response.model),
            usage: ctx.usage,
            status: outcome.status,
            iterations: outcome.iterations,
            repeats: outcome.repeats,
        })
    }
}

async fn finish_with_failure(ctx: &mut TurnContext<'_>, status: TurnStatus) -> TurnOutcome {
    warn!(?status, "turn ended without a usable reply");
    ctx.emit(TurnEvent::AssistantMessage {
        content: FAILURE_MESSAGE.into(),
    })
    .await;
    TurnOutcome::failure(status, ctx.usage.clone())
}

/// One request with tools disabled. Anything but a plain, non-empty answer
/// collapses to the failure message.
async fn tools_disabled_fallback(ctx: &mut TurnContext<'_>) -> Result<TurnOutcome, AgentError> {
    info!("tool calls kept failing, asking for a plain answer");
    correction::add_tools_disabled_instruction(ctx.conversation);

    let response = match ctx.request_model(false).await {
        Ok(response) => response,
        Err(AgentError::Cancelled) => return Err(AgentError::Cancelled),
        Err(e) => {
            warn!(error = %e, "tools-disabled request failed");
            return Ok(finish_with_failure(ctx, TurnStatus::ToolsDisabledFallback).await);
        }
    };

    if response.parse_error
        || response.tool_call_failure
        || response.has_tool_calls()
        || response.display.trim().is_empty()
    {
        return Ok(finish_with_failure(ctx, TurnStatus::ToolsDisabledFallback).await);
    }

    ctx.record_reply(&response).await;
    Ok(TurnOutcome {
        content: response.display,
        tool_calls: Vec::new(),
        model: response.model,
        usage: ctx.usage.clone(),
        status: TurnStatus::Completed,
        iterations: 0,
        repeats: 0,
    })
}
