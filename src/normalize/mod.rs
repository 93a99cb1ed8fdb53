//! Reduces every model-endpoint reply to one [`NormalizedResponse`].
//!
//! The wire shape is resolved once into [`ResponseShape`]; everything
//! downstream only ever sees the canonical record. `normalize` is total:
//! malformed input yields `parse_error` or `tool_call_failure`, never a panic.

mod inline;
pub mod repair;

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::types::{NormalizedResponse, ToolCall, Usage};

pub use inline::strip_think;
pub use repair::repair_json;

/// Content substituted for an empty or missing model reply.
pub const EMPTY_RESPONSE_SENTINEL: &str = "[Error: the model returned an empty response]";

static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_\-]*").unwrap());

static NULL: Value = Value::Null;

/// The reply shapes the normalizer understands, in resolution order.
#[derive(Debug, Clone, Copy)]
pub enum ResponseShape<'a> {
    /// `{content: "...", tool_calls?: [...]}`, already flattened by an adapter.
    PreNormalized(&'a Map<String, Value>),
    /// `choices[0].message` carrying a native `tool_calls` array.
    OpenAi(&'a Value),
    /// `choices[0].message.function_call`, the single-call legacy format.
    LegacyFunctionCall(&'a Value),
    /// `candidates[0]` with `content.parts`.
    Gemini(&'a Value),
    /// `choices[0].message` with text only.
    PlainText(&'a Value),
    /// `{error: {...}}` returned in place of a completion.
    ProviderError(&'a Value),
    Empty,
}

impl<'a> ResponseShape<'a> {
    pub fn classify(raw: &'a Value) -> Self {
        if let Some(obj) = raw.as_object() {
            if obj.get("content").is_some_and(Value::is_string) {
                return ResponseShape::PreNormalized(obj);
            }
        }
        if let Some(choice) = raw.get("choices").and_then(|c| c.get(0)) {
            let message = choice
                .get("message")
                .or_else(|| choice.get("delta"))
                .unwrap_or(&NULL);
            if message["tool_calls"].as_array().is_some_and(|a| !a.is_empty()) {
                return ResponseShape::OpenAi(message);
            }
            if message.get("function_call").is_some_and(Value::is_object) {
                return ResponseShape::LegacyFunctionCall(message);
            }
            return ResponseShape::PlainText(message);
        }
        if let Some(candidate) = raw.get("candidates").and_then(|c| c.get(0)) {
            return ResponseShape::Gemini(candidate);
        }
        if let Some(err) = raw.get("error").filter(|e| !e.is_null()) {
            return ResponseShape::ProviderError(err);
        }
        ResponseShape::Empty
    }
}

/// Normalize a raw endpoint reply. `is_known_tool` gates fallback inline
/// calls: blocks naming unregistered tools are treated as plain text.
pub fn normalize(raw: &Value, is_known_tool: impl Fn(&str) -> bool) -> NormalizedResponse {
    let shape = ResponseShape::classify(raw);
    debug!(shape = shape_name(&shape), "normalizing model reply");

    let mut response = match shape {
        ResponseShape::PreNormalized(obj) => from_pre_normalized(obj),
        ResponseShape::OpenAi(message) => from_openai(message),
        ResponseShape::LegacyFunctionCall(message) => from_legacy(message),
        ResponseShape::Gemini(candidate) => from_gemini(candidate, &is_known_tool),
        ResponseShape::PlainText(message) => NormalizedResponse {
            content: message_text(message),
            ..Default::default()
        },
        ResponseShape::ProviderError(err) => from_error(err, &is_known_tool),
        ResponseShape::Empty => NormalizedResponse::default(),
    };

    if response.model.is_none() {
        response.model = raw
            .get("model")
            .or_else(|| raw.get("modelVersion"))
            .and_then(Value::as_str)
            .map(String::from);
    }
    if response.usage.is_none() {
        response.usage = usage_from(raw);
    }

    finish(response, &is_known_tool)
}

/// Recognize a provider error body (typically an HTTP 400) that reports a
/// malformed tool call, so it can be corrected instead of surfacing as a
/// transport failure.
pub fn normalize_error_body(
    status: u16,
    body: &str,
    is_known_tool: impl Fn(&str) -> bool,
) -> Option<NormalizedResponse> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    let err = parsed.get("error").filter(|e| e.is_object())?;
    let response = from_error(err, &is_known_tool);
    if response.tool_call_failure {
        debug!(status, tool = ?response.failed_tool, "provider reported a malformed tool call");
        Some(finish(response, &is_known_tool))
    } else {
        None
    }
}

fn shape_name(shape: &ResponseShape<'_>) -> &'static str {
    match shape {
        ResponseShape::PreNormalized(_) => "pre_normalized",
        ResponseShape::OpenAi(_) => "openai",
        ResponseShape::LegacyFunctionCall(_) => "legacy_function_call",
        ResponseShape::Gemini(_) => "gemini",
        ResponseShape::PlainText(_) => "plain_text",
        ResponseShape::ProviderError(_) => "provider_error",
        ResponseShape::Empty => "empty",
    }
}

/// Tool arguments as an object. Missing or null become `{}`; strings are
/// parsed (with repair). Anything else is unusable.
pub(crate) fn coerce_arguments(args: Option<&Value>) -> Option<Value> {
    match args {
        None | Some(Value::Null) => Some(Value::Object(Map::new())),
        Some(v @ Value::Object(_)) => Some(v.clone()),
        Some(Value::String(s)) if s.trim().is_empty() => Some(Value::Object(Map::new())),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(v @ Value::Object(_)) => Some(v),
            _ => repair_json(s).ok(),
        },
        Some(_) => None,
    }
}

/// Parse one native call (`{id, function: {name, arguments}}` or flat
/// `{name, arguments|args}`). `Err` carries the tool name when known.
fn parse_native_call(tc: &Value) -> Result<ToolCall, Option<String>> {
    let function = tc.get("function").filter(|f| f.is_object()).unwrap_or(tc);
    let name = function
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    if name.is_empty() {
        return Err(None);
    }
    let raw_args = function
        .get("arguments")
        .or_else(|| function.get("args"))
        .or_else(|| function.get("parameters"));
    let arguments = coerce_arguments(raw_args).ok_or_else(|| Some(name.clone()))?;
    let id = tc
        .get("id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(ToolCall::generate_id);
    Ok(ToolCall::new(id, name, arguments))
}

/// Collect native calls. One malformed call fails the whole batch so the
/// model re-issues it coherently.
fn collect_native_calls<'v>(
    calls: impl IntoIterator<Item = &'v Value>,
    response: &mut NormalizedResponse,
) {
    for tc in calls {
        match parse_native_call(tc) {
            Ok(call) => response.tool_calls.push(call),
            Err(name) => {
                response.tool_call_failure = true;
                response.failed_tool = name;
                response.tool_calls.clear();
                return;
            }
        }
    }
}

/// OpenAI message content: a string, or an array of `{type: "text", text}` parts.
fn message_text(message: &Value) -> String {
    match &message["content"] {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn from_pre_normalized(obj: &Map<String, Value>) -> NormalizedResponse {
    let mut response = NormalizedResponse {
        content: obj
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        model: obj.get("model").and_then(Value::as_str).map(String::from),
        ..Default::default()
    };
    if let Some(calls) = obj
        .get("tool_calls")
        .or_else(|| obj.get("toolCalls"))
        .and_then(Value::as_array)
    {
        collect_native_calls(calls, &mut response);
    }
    response
}

fn from_openai(message: &Value) -> NormalizedResponse {
    let mut response = NormalizedResponse {
        content: message_text(message),
        ..Default::default()
    };
    if let Some(calls) = message["tool_calls"].as_array() {
        collect_native_calls(calls, &mut response);
    }
    if let Some(reasoning) = message.get("reasoning_content").filter(|r| r.is_string()) {
        response
            .provider_metadata
            .insert("reasoning_content".into(), reasoning.clone());
    }
    response
}

fn from_legacy(message: &Value) -> NormalizedResponse {
    let mut response = NormalizedResponse {
        content: message_text(message),
        ..Default::default()
    };
    collect_native_calls(std::iter::once(&message["function_call"]), &mut response);
    response
}

fn from_gemini(candidate: &Value, is_known_tool: &dyn Fn(&str) -> bool) -> NormalizedResponse {
    let mut response = NormalizedResponse::default();
    let mut text = Vec::new();
    let mut signatures = Map::new();

    let parts = candidate["content"]["parts"]
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default();
    for part in parts {
        if part.get("thought").and_then(Value::as_bool) == Some(true) {
            continue;
        }
        if let Some(t) = part.get("text").and_then(Value::as_str) {
            text.push(t);
        }
        if let Some(fc) = part.get("functionCall") {
            collect_native_calls(std::iter::once(fc), &mut response);
            if response.tool_call_failure {
                break;
            }
            if let (Some(sig), Some(call)) = (part.get("thoughtSignature"), response.tool_calls.last()) {
                signatures.insert(call.id.clone(), sig.clone());
            }
        }
    }
    response.content = text.join("");

    let finish_reason = candidate.get("finishReason").and_then(Value::as_str);
    if finish_reason == Some("MALFORMED_FUNCTION_CALL") {
        response.tool_call_failure = true;
        response.tool_calls.clear();
        response.failed_tool = candidate
            .get("finishMessage")
            .and_then(Value::as_str)
            .and_then(|m| failed_tool_from_text(m, is_known_tool));
    }
    if let Some(reason) = finish_reason {
        response
            .provider_metadata
            .insert("finish_reason".into(), Value::String(reason.into()));
    }
    if !signatures.is_empty() {
        response
            .provider_metadata
            .insert("thought_signatures".into(), Value::Object(signatures));
    }
    response
}

fn from_error(err: &Value, is_known_tool: &dyn Fn(&str) -> bool) -> NormalizedResponse {
    let code = err
        .get("code")
        .or_else(|| err.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let message = err.get("message").and_then(Value::as_str).unwrap_or("");
    let failed_generation = err.get("failed_generation").and_then(Value::as_str);

    if code == "tool_use_failed" || failed_generation.is_some() {
        let source = failed_generation.unwrap_or(message);
        return NormalizedResponse {
            tool_call_failure: true,
            failed_tool: failed_tool_from_text(source, is_known_tool),
            ..Default::default()
        };
    }

    NormalizedResponse {
        content: format!("[Provider error] {message}"),
        parse_error: true,
        parse_excerpt: Some(repair::excerpt(message)),
        ..Default::default()
    }
}

/// First identifier in provider failure text that names a registered tool.
fn failed_tool_from_text(text: &str, is_known_tool: &dyn Fn(&str) -> bool) -> Option<String> {
    IDENT_RE
        .find_iter(text)
        .map(|m| m.as_str())
        .find(|ident| is_known_tool(ident))
        .map(String::from)
}

fn usage_from(raw: &Value) -> Option<Usage> {
    let read = |v: &Value, key: &str| v.get(key).and_then(Value::as_u64).unwrap_or(0) as u32;
    if let Some(u) = raw.get("usage").filter(|u| u.is_object()) {
        return Some(Usage {
            prompt_tokens: read(u, "prompt_tokens"),
            completion_tokens: read(u, "completion_tokens"),
            total_tokens: read(u, "total_tokens"),
        });
    }
    raw.get("usageMetadata").filter(|u| u.is_object()).map(|u| Usage {
        prompt_tokens: read(u, "promptTokenCount"),
        completion_tokens: read(u, "candidatesTokenCount"),
        total_tokens: read(u, "totalTokenCount"),
    })
}

/// Inline fallback, display text, and the empty-reply sentinel.
fn finish(
    mut response: NormalizedResponse,
    is_known_tool: &dyn Fn(&str) -> bool,
) -> NormalizedResponse {
    if response.tool_call_failure {
        response.display = strip_think(&response.content).trim().to_string();
        return response;
    }

    if response.tool_calls.is_empty() && !response.parse_error {
        let parsed = inline::parse_inline_tool_calls(&response.content, is_known_tool);
        response.display = parsed.display;
        if !parsed.calls.is_empty() {
            debug!(count = parsed.calls.len(), "recovered inline tool calls");
            response.tool_calls = parsed.calls;
        } else if let Some(bad) = parsed.error {
            response.parse_error = true;
            response.parse_excerpt = Some(bad);
        }
    } else {
        response.display = strip_think(&response.content).trim().to_string();
    }

    if response.display.is_empty() && response.tool_calls.is_empty() && !response.parse_error {
        response.content = EMPTY_RESPONSE_SENTINEL.into();
        response.parse_error = true;
    }
    response
}
