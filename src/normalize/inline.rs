//! Fallback parsing of tool calls written as fenced JSON inside reply text,
//! for providers or models that lack native structured tool calling.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::coerce_arguments;
use super::repair::{excerpt, repair_json};
use crate::types::ToolCall;

static THINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think(?:ing)?>.*?(?:</think(?:ing)?>|\z)").unwrap());

/// Triple-backtick fences with an optional language tag.
static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[ \t]*([A-Za-z0-9_]*)[^\n`]*\n?(.*?)```").unwrap());

/// One- or two-backtick fences, only recognized when tagged as JSON/JS.
static LOOSE_FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)`{1,2}[ \t]*(json|javascript|js)[ \t]*\r?\n(.*?)`{1,2}").unwrap()
});

static WRAPPER_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"tool_calls?|toolCall|function_call").unwrap());

static NAME_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["']?name["']?\s*:"#).unwrap());

static ARGS_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["']?(arguments|parameters|args)["']?\s*:"#).unwrap());

const ACCEPTED_LANGS: &[&str] = &["", "json", "json5", "jsonc", "javascript", "js", "tool_call"];

/// Result of scanning reply text for inline tool calls.
#[derive(Debug, Default)]
pub(crate) struct InlineParse {
    /// Text with reasoning spans and recognized call blocks removed.
    pub display: String,
    pub calls: Vec<ToolCall>,
    /// Excerpt of a block that looked like a tool call but could not be parsed.
    pub error: Option<String>,
}

/// Remove `<think>...</think>` spans (and an unterminated trailing one).
pub fn strip_think(text: &str) -> String {
    THINK_RE.replace_all(text, "").into_owned()
}

struct Block<'t> {
    range: Range<usize>,
    lang: String,
    body: &'t str,
}

fn find_blocks(text: &str) -> Vec<Block<'_>> {
    let collect = |re: &Regex| -> Vec<Block<'_>> {
        re.captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                Some(Block {
                    range: whole.range(),
                    lang: caps.get(1).map_or("", |m| m.as_str()).to_ascii_lowercase(),
                    body: caps.get(2)?.as_str(),
                })
            })
            .collect()
    };

    let strict = collect(&FENCE_RE);
    if !strict.is_empty() {
        return strict;
    }
    collect(&LOOSE_FENCE_RE)
}

fn looks_like_tool_call(body: &str) -> bool {
    WRAPPER_KEY_RE.is_match(body) || (NAME_KEY_RE.is_match(body) && ARGS_KEY_RE.is_match(body))
}

fn parse_block(body: &str) -> Result<Value, String> {
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(body.trim()) {
        return Ok(value);
    }
    repair_json(body).map_err(|_| excerpt(body))
}

/// `(name, arguments)` pairs described by a parsed block.
fn calls_from_value(value: &Value) -> Vec<(String, Value)> {
    if let Some(list) = value.get("tool_calls").and_then(Value::as_array) {
        return list.iter().filter_map(call_from_object).collect();
    }
    for key in ["tool_call", "toolCall", "function_call"] {
        if let Some(inner) = value.get(key) {
            return call_from_object(inner).into_iter().collect();
        }
    }
    call_from_object(value).into_iter().collect()
}

fn call_from_object(value: &Value) -> Option<(String, Value)> {
    let target = value
        .get("function")
        .filter(|f| f.is_object())
        .unwrap_or(value);
    let name = target.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }
    let args = target
        .get("arguments")
        .or_else(|| target.get("parameters"))
        .or_else(|| target.get("args"));
    Some((name.to_string(), coerce_arguments(args)?))
}

/// Scan `text` for fenced tool-call JSON naming a known tool.
///
/// Unknown tool names are ignored rather than reported. A block that looks
/// like a call but cannot be parsed even after repair is reported through
/// `error`, but only when no call was recovered at all.
pub(crate) fn parse_inline_tool_calls(
    text: &str,
    is_known_tool: &dyn Fn(&str) -> bool,
) -> InlineParse {
    let stripped = strip_think(text);
    let mut calls = Vec::new();
    let mut removed: Vec<Range<usize>> = Vec::new();
    let mut error = None;

    let blocks = find_blocks(&stripped);
    for block in &blocks {
        if !ACCEPTED_LANGS.contains(&block.lang.as_str()) || !looks_like_tool_call(block.body) {
            continue;
        }
        let value = match parse_block(block.body) {
            Ok(v) => v,
            Err(bad) => {
                error.get_or_insert(bad);
                continue;
            }
        };
        let known: Vec<(String, Value)> = calls_from_value(&value)
            .into_iter()
            .filter(|(name, _)| is_known_tool(name))
            .collect();
        if known.is_empty() {
            continue;
        }
        calls.extend(
            known
                .into_iter()
                .map(|(name, args)| ToolCall::new(ToolCall::generate_id(), name, args)),
        );
        removed.push(block.range.clone());
    }

    // Whole reply is a bare JSON call with no fence around it.
    if blocks.is_empty() {
        let trimmed = stripped.trim();
        if trimmed.starts_with('{') && trimmed.ends_with('}') && looks_like_tool_call(trimmed) {
            match parse_block(trimmed) {
                Ok(value) => {
                    for (name, args) in calls_from_value(&value) {
                        if is_known_tool(&name) {
                            calls.push(ToolCall::new(ToolCall::generate_id(), name, args));
                        }
                    }
                    if !calls.is_empty() {
                        removed.push(0..stripped.len());
                    }
                }
                Err(bad) => error = Some(bad),
            }
        }
    }

    let mut display = String::with_capacity(stripped.len());
    let mut cursor = 0;
    for range in &removed {
        display.push_str(&stripped[cursor..range.start]);
        cursor = range.end;
    }
    display.push_str(&stripped[cursor..]);

    InlineParse {
        display: display.trim().to_string(),
        error: if calls.is_empty() { error } else { None },
        calls,
    }
}
