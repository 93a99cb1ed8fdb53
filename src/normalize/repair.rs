//! Best-effort repair of almost-JSON emitted by models inside fenced blocks.
//!
//! Each pass is a small scanner that is aware of double-quoted strings, so
//! repairs never touch string contents. Passes are applied cumulatively and
//! the text is re-parsed after each one; the first successful parse wins.

use serde_json::Value;

use crate::error::RepairError;

const EXCERPT_LEN: usize = 120;

type Pass = fn(&str) -> String;

const PASSES: &[Pass] = &[
    normalize_smart_quotes,
    single_to_double_quotes,
    parens_to_brackets,
    strip_trailing_commas,
    quote_bare_keys,
    escape_inner_quotes,
];

/// Parse `input` as a JSON object, repairing common model mistakes:
/// trailing commas, single-quoted strings, `( )` used for arrays,
/// unquoted keys and unescaped quotes inside string values.
pub fn repair_json(input: &str) -> Result<Value, RepairError> {
    let candidate = extract_object(input).ok_or(RepairError::NoObject)?;

    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(candidate) {
        return Ok(value);
    }

    let mut text = candidate.to_string();
    for pass in PASSES {
        text = pass(&text);
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&text) {
            return Ok(value);
        }
    }

    Err(RepairError::Unrepairable {
        excerpt: excerpt(candidate),
    })
}

/// First `{` through last `}`.
fn extract_object(input: &str) -> Option<&str> {
    let start = input.find('{')?;
    let end = input.rfind('}')?;
    (end > start).then(|| &input[start..=end])
}

pub(crate) fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= EXCERPT_LEN {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(EXCERPT_LEN).collect();
    format!("{cut}...")
}

/// Tracks whether the scanner sits inside a double-quoted string.
#[derive(Default)]
struct StringState {
    in_string: bool,
    escaped: bool,
}

impl StringState {
    /// Feed one char. Returns true if the char belongs to a string literal
    /// (including its quotes) and must be copied verbatim.
    fn consume(&mut self, c: char) -> bool {
        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if c == '\\' {
                self.escaped = true;
            } else if c == '"' {
                self.in_string = false;
            }
            return true;
        }
        if c == '"' {
            self.in_string = true;
            return true;
        }
        false
    }
}

fn normalize_smart_quotes(s: &str) -> String {
    s.replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
}

fn single_to_double_quotes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut state = StringState::default();
    let mut in_single = false;
    let mut escaped = false;

    for c in s.chars() {
        if in_single {
            if escaped {
                escaped = false;
                if c == '\'' {
                    out.pop();
                }
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '\'' => {
                    in_single = false;
                    out.push('"');
                }
                '"' => out.push_str("\\\""),
                _ => out.push(c),
            }
            continue;
        }
        if state.consume(c) {
            out.push(c);
            continue;
        }
        if c == '\'' {
            in_single = true;
            out.push('"');
        } else {
            out.push(c);
        }
    }
    out
}

fn strip_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut state = StringState::default();

    for (i, &c) in chars.iter().enumerate() {
        if state.consume(c) {
            out.push(c);
            continue;
        }
        if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some('}') | Some(']') | None) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn parens_to_brackets(s: &str) -> String {
    let mut state = StringState::default();
    s.chars()
        .map(|c| {
            if state.consume(c) {
                return c;
            }
            match c {
                '(' => '[',
                ')' => ']',
                other => other,
            }
        })
        .collect()
}

fn quote_bare_keys(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 16);
    let mut state = StringState::default();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if state.consume(c) {
            out.push(c);
            i += 1;
            continue;
        }
        let is_ident_start = c.is_ascii_alphabetic() || c == '_' || c == '$';
        let after_separator = matches!(out.trim_end().chars().next_back(), Some('{') | Some(','));
        if is_ident_start && after_separator {
            let start = i;
            while i < chars.len() && is_ident_char(chars[i]) {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            let next = chars[i..].iter().find(|ch| !ch.is_whitespace());
            if next == Some(&':') {
                out.push('"');
                out.push_str(&ident);
                out.push('"');
            } else {
                out.push_str(&ident);
            }
            continue;
        }
        out.push(c);
        i += 1;
    }
    out
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// A quote inside a string closes it only when followed by a structural
/// character; anything else is taken to be an unescaped inner quote.
fn escape_inner_quotes(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 16);
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            continue;
        }
        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }
        match c {
            '\\' => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if matches!(next, Some(',') | Some('}') | Some(']') | Some(':') | None) {
                    in_string = false;
                    out.push(c);
                } else {
                    out.push_str("\\\"");
                }
            }
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}
