//! Best-effort mapping of model output onto a page schema.
//!
//! Model text is first decoded as a JSON object. When that fails the text is
//! scanned line by line for `key: value` pairs. Either way the result carries
//! exactly the page's fields: absent fields are null and unknown keys are
//! dropped.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::record::{PageFields, empty_page};
use crate::schema::PageSchema;

static KEY_VALUE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*•]+|\d+[.)])?\s*(?P<key>[^:=]+?)\s*[:=]\s*(?P<value>.*)$")
        .expect("key/value line pattern is valid")
});

static JSON_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?P<key>"(?:[^"\\]|\\.)*")\s*:\s*(?P<value>"(?:[^"\\]|\\.)*"|null|true|false|-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?)"#,
    )
    .expect("json pair pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    Structured,
    /// Structured decoding failed and the line heuristic was used instead.
    Heuristic,
}

impl ParseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Structured => "structured",
            Self::Heuristic => "heuristic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOutcome {
    pub fields: PageFields,
    pub mode: ParseMode,
    pub dropped_keys: usize,
}

impl ParseOutcome {
    pub fn fallback_used(&self) -> bool {
        self.mode == ParseMode::Heuristic
    }

    pub fn matched_fields(&self) -> usize {
        self.fields.values().filter(|value| value.is_some()).count()
    }
}

/// Parses raw model text into the page's fields. Never fails.
pub fn parse(raw_text: &str, page: &PageSchema) -> ParseOutcome {
    let matcher = FieldMatcher::new(page);
    let mut fields = empty_page(page);

    let (mode, dropped_keys) = match decode_object(raw_text) {
        Some(object) => {
            let mut dropped = 0;
            collect_object(&object, &matcher, &mut fields, &mut dropped);
            (ParseMode::Structured, dropped)
        }
        None => {
            let dropped = collect_lines(raw_text, &matcher, &mut fields);
            (ParseMode::Heuristic, dropped)
        }
    };

    let outcome = ParseOutcome {
        fields,
        mode,
        dropped_keys,
    };

    if outcome.fallback_used() {
        warn!(
            page = page.page_number,
            matched = outcome.matched_fields(),
            "model output was not a JSON object; used line heuristic"
        );
    }
    if dropped_keys > 0 {
        debug!(
            page = page.page_number,
            dropped = dropped_keys,
            "dropped keys not present in page schema"
        );
    }

    outcome
}

/// Resolves model keys to schema fields: exact match first, then a
/// case- and punctuation-insensitive form.
struct FieldMatcher<'a> {
    page: &'a PageSchema,
    normalized: HashMap<String, &'a str>,
}

impl<'a> FieldMatcher<'a> {
    fn new(page: &'a PageSchema) -> Self {
        let mut normalized = HashMap::new();
        for field in &page.fields {
            normalized
                .entry(normalize_key(field))
                .or_insert(field.as_str());
        }
        Self { page, normalized }
    }

    fn resolve(&self, key: &str) -> Option<&'a str> {
        if let Some(field) = self.page.fields.iter().find(|field| *field == key) {
            return Some(field.as_str());
        }
        let normalized = normalize_key(key);
        if normalized.is_empty() {
            return None;
        }
        self.normalized.get(&normalized).copied()
    }
}

fn normalize_key(key: &str) -> String {
    let mut normalized = String::with_capacity(key.len());
    let mut pending_separator = false;

    for character in key.chars() {
        if character.is_alphanumeric() {
            if pending_separator && !normalized.is_empty() {
                normalized.push('_');
            }
            pending_separator = false;
            normalized.extend(character.to_lowercase());
        } else {
            pending_separator = true;
        }
    }

    normalized
}

fn decode_object(raw_text: &str) -> Option<Map<String, Value>> {
    let trimmed = raw_text.trim();
    let candidate = fenced_block(trimmed).unwrap_or(trimmed);

    candidate
        .match_indices('{')
        .find_map(|(start, _)| leading_object(&candidate[start..]))
}

/// The JSON object at the start of `text`, ignoring whatever follows it.
fn leading_object(text: &str) -> Option<Map<String, Value>> {
    let mut values = serde_json::Deserializer::from_str(text).into_iter::<Value>();
    match values.next() {
        Some(Ok(Value::Object(object))) => Some(object),
        _ => None,
    }
}

/// Body of the first Markdown code fence, without its language tag.
fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    let body_start = after_open.find('\n').map(|index| index + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    Some(body[..close].trim())
}

fn collect_object(
    object: &Map<String, Value>,
    matcher: &FieldMatcher<'_>,
    fields: &mut PageFields,
    dropped: &mut usize,
) {
    let mut sections = Vec::new();

    for (key, value) in object {
        match matcher.resolve(key) {
            Some(field) => assign(fields, field, render_value(value)),
            None => match value {
                Value::Object(section) => sections.push(section),
                _ => *dropped += 1,
            },
        }
    }

    for section in sections {
        collect_object(section, matcher, fields, dropped);
    }
}

fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) if text.trim().is_empty() => None,
        Value::String(text) => Some(text.clone()),
        Value::Bool(true) => Some("Yes".to_string()),
        Value::Bool(false) => Some("No".to_string()),
        Value::Number(number) => Some(number.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

fn collect_lines(raw_text: &str, matcher: &FieldMatcher<'_>, fields: &mut PageFields) -> usize {
    let mut dropped = 0;

    for line in raw_text.lines() {
        if JSON_PAIR.is_match(line) {
            dropped += collect_json_pairs(line, matcher, fields);
            continue;
        }

        let Some(captures) = KEY_VALUE_LINE.captures(line) else {
            continue;
        };
        let key = clean_token(&captures["key"]);
        if key.is_empty() {
            continue;
        }

        match matcher.resolve(key) {
            Some(field) => {
                let value = clean_token(&captures["value"]);
                let value = if value.is_empty() || value.eq_ignore_ascii_case("null") {
                    None
                } else {
                    Some(value.to_string())
                };
                assign(fields, field, value);
            }
            None => dropped += 1,
        }
    }

    dropped
}

/// Reads every `"key": value` pair on a line of broken JSON on its own, so a
/// value never swallows the pairs after it.
fn collect_json_pairs(line: &str, matcher: &FieldMatcher<'_>, fields: &mut PageFields) -> usize {
    let mut dropped = 0;

    for captures in JSON_PAIR.captures_iter(line) {
        let Ok(key) = serde_json::from_str::<String>(&captures["key"]) else {
            continue;
        };
        match matcher.resolve(&key) {
            Some(field) => {
                let value = serde_json::from_str::<Value>(&captures["value"])
                    .ok()
                    .and_then(|value| render_value(&value));
                assign(fields, field, value);
            }
            None => dropped += 1,
        }
    }

    dropped
}

fn clean_token(token: &str) -> &str {
    token
        .trim()
        .trim_end_matches(',')
        .trim_matches(|character: char| {
            character == '"'
                || character == '\''
                || character == '*'
                || character == '`'
                || character.is_whitespace()
        })
}

/// Keeps the first non-null value seen for a field.
fn assign(fields: &mut PageFields, field: &str, value: Option<String>) {
    if let Some(slot) = fields.get_mut(field) {
        if slot.is_none() {
            *slot = value;
        }
    }
}
