//! Lenient parsing of the completion judge's JSON answer.
//!
//! Judges wrap their JSON in prose, markdown fences or inline code, and
//! sometimes quote numbers. Strategies are tried from strictest to loosest.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_COMPLETION_THRESHOLD: f64 = 0.7;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletionVerdict {
    pub completed: bool,
    pub reason: String,
    /// Always within `[0, 1]`.
    pub confidence: f64,
}

impl CompletionVerdict {
    pub fn unparseable() -> Self {
        Self {
            completed: false,
            reason: "parse failure".into(),
            confidence: 0.0,
        }
    }

    /// Completion must be claimed with confidence strictly above `threshold`.
    pub fn is_satisfied(&self, threshold: f64) -> bool {
        self.completed && self.confidence > threshold
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("no JSON verdict found in judge answer")]
pub struct JudgeUnparseable;

pub fn try_parse_verdict(text: &str) -> Result<CompletionVerdict, JudgeUnparseable> {
    let text = text.trim();

    if let Some(obj) = parse_object(text) {
        return Ok(from_object(&obj));
    }

    for block in code_blocks(text) {
        if let Some(obj) = parse_object(block) {
            return Ok(from_object(&obj));
        }
    }

    let mut candidates = brace_candidates(text);
    candidates.sort_by_key(|c| c.len());
    let parsed: Vec<Map<String, Value>> = candidates.iter().filter_map(|c| parse_object(c)).collect();
    parsed
        .iter()
        .find(|obj| obj.contains_key("completed"))
        .or_else(|| parsed.first())
        .map(from_object)
        .ok_or(JudgeUnparseable)
}

/// Like [`try_parse_verdict`], but an unparseable answer counts as "not completed".
pub fn parse_verdict(text: &str) -> CompletionVerdict {
    try_parse_verdict(text).unwrap_or_else(|_| {
        warn!(answer = text, "could not parse completion verdict");
        CompletionVerdict::unparseable()
    })
}

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Contents of ```json fences, then untagged fences, then inline `{...}` spans.
fn code_blocks(text: &str) -> Vec<&str> {
    let mut tagged = Vec::new();
    let mut untagged = Vec::new();
    for (i, segment) in text.split("```").enumerate() {
        // Odd segments sit between a pair of fences.
        if i % 2 == 0 {
            continue;
        }
        let body = segment.trim_start();
        if body.get(..4).is_some_and(|tag| tag.eq_ignore_ascii_case("json")) {
            tagged.push(body[4..].trim());
        } else {
            untagged.push(body.trim());
        }
    }

    let inline = text
        .split('`')
        .map(str::trim)
        .filter(|s| s.starts_with('{') && s.ends_with('}'));

    tagged
        .into_iter()
        .chain(untagged)
        .filter(|s| s.starts_with('{'))
        .chain(inline)
        .collect()
}

/// Every balanced `{...}` span, string-aware, that mentions `completed`.
/// Falls back to all balanced spans when none does.
fn brace_candidates(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    for (start, _) in text.match_indices('{') {
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, ch) in text[start..].char_indices() {
            if in_string {
                match ch {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match ch {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        spans.push(&text[start..start + offset + 1]);
                        break;
                    }
                }
                _ => {}
            }
        }
    }

    let mentioning: Vec<&str> = spans.iter().copied().filter(|s| s.contains("completed")).collect();
    if mentioning.is_empty() {
        spans
    } else {
        mentioning
    }
}

fn from_object(obj: &Map<String, Value>) -> CompletionVerdict {
    let completed = match obj.get("completed") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        _ => false,
    };
    let reason = match obj.get("reason") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let confidence = match obj.get("confidence") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    let confidence = if confidence.is_nan() { 0.0 } else { confidence.clamp(0.0, 1.0) };
    CompletionVerdict {
        completed,
        reason,
        confidence,
    }
}
