//! Parser for the grounding model's `Thought: ... / Action: name(k=v, ...)` answers.
//!
//! The grammar the model follows is loose: the `Action:` marker may be missing,
//! bounding boxes come either as `'[x1, y1, x2, y2]'` or as `<bbox>x1 y1 x2 y2</bbox>`,
//! and the whole answer is sometimes just prose. Parsing therefore never fails;
//! it degrades to a partial record and reports what it could not understand.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Call identifiers recognised when the text carries no `Action:` marker.
const ACTION_NAMES: &[&str] = &[
    "click",
    "left_double",
    "double_click",
    "right_single",
    "right_click",
    "long_press",
    "drag",
    "scroll",
    "type",
    "hotkey",
    "wait",
    "finished",
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Click,
    DoubleClick,
    RightClick,
    Drag,
    Scroll,
    Type,
    Hotkey,
    Wait,
    Finished,
    #[default]
    Unknown,
}

impl ActionKind {
    /// Resolves a grammar identifier, including the model's aliases.
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name.trim().to_ascii_lowercase().as_str() {
            "click" => Self::Click,
            "double_click" | "left_double" => Self::DoubleClick,
            "right_click" | "right_single" | "long_press" => Self::RightClick,
            "drag" => Self::Drag,
            "scroll" => Self::Scroll,
            "type" => Self::Type,
            "hotkey" => Self::Hotkey,
            "wait" => Self::Wait,
            "finished" => Self::Finished,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::DoubleClick => "double_click",
            Self::RightClick => "right_click",
            Self::Drag => "drag",
            Self::Scroll => "scroll",
            Self::Type => "type",
            Self::Hotkey => "hotkey",
            Self::Wait => "wait",
            Self::Finished => "finished",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }
}

/// One decision taken by the grounding model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub thought: String,
    pub action: ActionKind,
    pub key: Option<String>,
    pub content: Option<String>,
    /// Normalized `[x1, y1, x2, y2]`, each component nominally in `0..=1000`.
    pub start_box: Option<[u32; 4]>,
    pub end_box: Option<[u32; 4]>,
    pub direction: Option<Direction>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseDegraded {
    #[error("no action expression found")]
    NoActionExpression,
    #[error("malformed call expression: {0}")]
    MalformedCall(String),
    #[error("unknown action `{0}`")]
    UnknownAction(String),
    #[error("`{0}` holds fewer than four coordinates")]
    IncompleteBox(String),
    #[error("unrecognised direction `{0}`")]
    InvalidDirection(String),
}

#[derive(Clone, Debug, Default)]
pub struct ParsedAction {
    pub record: ActionRecord,
    pub issues: Vec<ParseDegraded>,
}

impl ParsedAction {
    pub fn is_degraded(&self) -> bool {
        !self.issues.is_empty()
    }
}

/// Turns a raw model answer into an [`ActionRecord`]. Never fails.
pub fn parse_action_output(output: &str) -> ParsedAction {
    let text = output.trim();
    let mut record = ActionRecord {
        thought: extract_thought(text).unwrap_or_default(),
        ..ActionRecord::default()
    };
    let mut issues = Vec::new();

    match locate_expression(text) {
        None => issues.push(ParseDegraded::NoActionExpression),
        Some(expr) => match split_call(&expr) {
            Some((name, args)) => {
                record.action = resolve_kind(name, &mut issues);
                assign_arguments(args, &mut record, &mut issues);
            }
            None => {
                issues.push(ParseDegraded::MalformedCall(expr.clone()));
                if let Some(name) = leading_identifier(&expr) {
                    record.action = resolve_kind(name, &mut issues);
                }
            }
        },
    }

    // Nothing recognisable: keep the raw answer so the step log still shows it.
    if record.action == ActionKind::Unknown && record.thought.is_empty() {
        record.thought = text.to_string();
    }

    ParsedAction { record, issues }
}

fn resolve_kind(name: &str, issues: &mut Vec<ParseDegraded>) -> ActionKind {
    ActionKind::from_name(name).unwrap_or_else(|| {
        issues.push(ParseDegraded::UnknownAction(name.to_string()));
        ActionKind::Unknown
    })
}

fn extract_thought(text: &str) -> Option<String> {
    let start = text.find("Thought:")? + "Thought:".len();
    let rest = &text[start..];
    let end = rest.find("Action:").unwrap_or(rest.len());
    Some(rest[..end].trim().to_string())
}

fn locate_expression(text: &str) -> Option<String> {
    if let Some(pos) = text.find("Action:") {
        let rest = text[pos + "Action:".len()..].trim_start();
        if let Some(expr) = balanced_call(rest, 0) {
            return Some(expr.to_string());
        }
        if let Some(expr) = find_action_call(rest).and_then(|at| call_span(rest, at)) {
            return Some(expr.to_string());
        }
        let line = rest.lines().next().unwrap_or_default().trim();
        if !line.is_empty() {
            return Some(line.to_string());
        }
    }

    if let Some(expr) = find_action_call(text).and_then(|at| call_span(text, at)) {
        return Some(expr.to_string());
    }

    if text.contains('(') && text.contains(')') {
        return Some(text.to_string());
    }
    None
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Earliest byte offset of a known identifier directly followed by `(`.
fn find_action_call(text: &str) -> Option<usize> {
    ACTION_NAMES
        .iter()
        .filter_map(|name| {
            let pattern = format!("{name}(");
            text.match_indices(&pattern).map(|(at, _)| at).find(|&at| {
                text[..at]
                    .chars()
                    .next_back()
                    .map_or(true, |prev| !is_ident_char(prev))
            })
        })
        .min()
}

/// Smallest `identifier( ... )` starting at `start` whose parentheses balance
/// outside of quoted strings.
fn balanced_call(text: &str, start: usize) -> Option<&str> {
    let tail = text.get(start..)?;
    let name_len = tail.find(|c: char| !is_ident_char(c))?;
    if name_len == 0 || !tail[name_len..].starts_with('(') {
        return None;
    }

    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in tail.char_indices().skip(tail[..name_len].chars().count()) {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&tail[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Call starting at `start`, balanced when possible. An unescaped quote in
/// the content (`'I'm here'`) keeps the balanced scan open, so fall back to
/// the span ending at the last `)` on the call's line.
fn call_span(text: &str, start: usize) -> Option<&str> {
    balanced_call(text, start).or_else(|| {
        let line = text.get(start..)?.lines().next()?;
        let open = line.find('(')?;
        let close = line.rfind(')')?;
        (close > open).then(|| &line[..=close])
    })
}

fn split_call(expr: &str) -> Option<(&str, &str)> {
    let expr = expr.trim();
    let open = expr.find('(')?;
    let name = &expr[..open];
    if name.is_empty() || !name.chars().all(is_ident_char) {
        return None;
    }
    let close = expr.rfind(')')?;
    if close < open {
        return None;
    }
    Some((name, &expr[open + 1..close]))
}

fn leading_identifier(expr: &str) -> Option<&str> {
    let expr = expr.trim_start();
    let end = expr.find(|c: char| !is_ident_char(c)).unwrap_or(expr.len());
    (end > 0).then(|| &expr[..end])
}

/// Splits call arguments on commas that sit outside quotes and outside
/// `[...]` / `<...>` nesting.
fn split_arguments(args: &str) -> Vec<String> {
    let mut params = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut depth: i32 = 0;

    for c in args.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            current.push(c);
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '[' | '<' => depth += 1,
            ']' | '>' => depth -= 1,
            ',' if depth <= 0 => {
                params.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        params.push(current.trim().to_string());
    }
    params
}

fn assign_arguments(args: &str, record: &mut ActionRecord, issues: &mut Vec<ParseDegraded>) {
    for param in split_arguments(args) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        if key.contains("box") {
            let numbers = box_numbers(value);
            if numbers.len() < 4 {
                issues.push(ParseDegraded::IncompleteBox(key.to_string()));
                continue;
            }
            let quad = [numbers[0], numbers[1], numbers[2], numbers[3]];
            match key {
                "start_box" => record.start_box = Some(quad),
                "end_box" => record.end_box = Some(quad),
                _ => {}
            }
            continue;
        }

        match key {
            "key" => record.key = Some(strip_quotes(value).to_string()),
            "content" => record.content = Some(unescape(strip_quotes(value))),
            "direction" => {
                let raw = strip_quotes(value);
                match Direction::parse(raw) {
                    Some(direction) => record.direction = Some(direction),
                    None => issues.push(ParseDegraded::InvalidDirection(raw.to_string())),
                }
            }
            _ => {}
        }
    }
}

fn box_numbers(value: &str) -> Vec<u32> {
    let source = value
        .find("<bbox>")
        .and_then(|open| {
            let inner = &value[open + "<bbox>".len()..];
            inner.find("</bbox>").map(|close| &inner[..close])
        })
        .unwrap_or(value);

    source
        .split(|c: char| !c.is_ascii_digit())
        .filter(|run| !run.is_empty())
        .filter_map(|run| run.parse::<u32>().ok())
        .collect()
}

fn strip_quotes(value: &str) -> &str {
    value.trim().trim_matches(|c| c == '"' || c == '\'')
}

fn unescape(value: &str) -> String {
    value
        .replace("\\n", "\n")
        .replace("\\\"", "\"")
        .replace("\\'", "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_thought_and_click() {
        let parsed = parse_action_output(
            "Thought: tap the search field\nAction: click(start_box='[100,200,300,400]')",
        );
        assert!(!parsed.is_degraded());
        assert_eq!(parsed.record.thought, "tap the search field");
        assert_eq!(parsed.record.action, ActionKind::Click);
        assert_eq!(parsed.record.start_box, Some([100, 200, 300, 400]));
        assert_eq!(parsed.record.end_box, None);
    }

    #[test]
    fn reads_bbox_tag_form() {
        let parsed = parse_action_output(
            "Action: drag(start_box='<bbox>813 389 938 407</bbox>', end_box='<bbox>10 20 30 40</bbox>')",
        );
        assert_eq!(parsed.record.action, ActionKind::Drag);
        assert_eq!(parsed.record.start_box, Some([813, 389, 938, 407]));
        assert_eq!(parsed.record.end_box, Some([10, 20, 30, 40]));
    }

    #[test]
    fn commas_inside_quotes_and_brackets_do_not_split() {
        let parsed = parse_action_output(
            "Action: scroll(start_box='[500, 500, 600, 600]', direction='down')",
        );
        assert_eq!(parsed.record.action, ActionKind::Scroll);
        assert_eq!(parsed.record.start_box, Some([500, 500, 600, 600]));
        assert_eq!(parsed.record.direction, Some(Direction::Down));

        let typed = parse_action_output("Action: type(content='hello, world\\n')");
        assert_eq!(typed.record.action, ActionKind::Type);
        assert_eq!(typed.record.content.as_deref(), Some("hello, world\n"));
    }

    #[test]
    fn unescapes_content_quotes() {
        let parsed = parse_action_output(r#"Action: finished(content='it\'s \"done\" now')"#);
        assert_eq!(parsed.record.action, ActionKind::Finished);
        assert_eq!(parsed.record.content.as_deref(), Some("it's \"done\" now"));
    }

    #[test]
    fn hotkey_key_is_quote_stripped() {
        let parsed = parse_action_output("Thought: go home\nAction: hotkey(key='home')");
        assert_eq!(parsed.record.action, ActionKind::Hotkey);
        assert_eq!(parsed.record.key.as_deref(), Some("home"));
    }

    #[test]
    fn finds_bare_call_without_marker() {
        let parsed =
            parse_action_output("I should press it now: left_double(start_box='[1,2,3,4]') then wait");
        assert_eq!(parsed.record.action, ActionKind::DoubleClick);
        assert_eq!(parsed.record.start_box, Some([1, 2, 3, 4]));
    }

    #[test]
    fn identifier_inside_longer_name_is_not_a_match() {
        let parsed = parse_action_output("double_click(start_box='[5,6,7,8]')");
        assert_eq!(parsed.record.action, ActionKind::DoubleClick);
        assert_eq!(parsed.record.start_box, Some([5, 6, 7, 8]));
    }

    #[test]
    fn prose_folds_into_thought() {
        let parsed = parse_action_output("The page is still loading, nothing to do");
        assert_eq!(parsed.record.action, ActionKind::Unknown);
        assert_eq!(parsed.record.thought, "The page is still loading, nothing to do");
        assert_eq!(parsed.issues, vec![ParseDegraded::NoActionExpression]);
    }

    #[test]
    fn empty_input_is_unknown() {
        let parsed = parse_action_output("   ");
        assert_eq!(parsed.record, ActionRecord::default());
        assert!(parsed.is_degraded());
    }

    #[test]
    fn missing_parentheses_keeps_identifier() {
        let parsed = parse_action_output("Thought: done\nAction: wait");
        assert_eq!(parsed.record.action, ActionKind::Wait);
        assert!(matches!(parsed.issues[0], ParseDegraded::MalformedCall(_)));
    }

    #[test]
    fn short_box_stays_unset() {
        let parsed = parse_action_output("Action: click(start_box='[100, 200]')");
        assert_eq!(parsed.record.action, ActionKind::Click);
        assert_eq!(parsed.record.start_box, None);
        assert_eq!(
            parsed.issues,
            vec![ParseDegraded::IncompleteBox("start_box".into())]
        );
    }

    #[test]
    fn unknown_identifier_degrades() {
        let parsed = parse_action_output("Thought: hmm\nAction: swipe_up(speed=3)");
        assert_eq!(parsed.record.action, ActionKind::Unknown);
        assert_eq!(parsed.record.thought, "hmm");
        assert_eq!(
            parsed.issues,
            vec![ParseDegraded::UnknownAction("swipe_up".into())]
        );
    }

    #[test]
    fn extra_box_digits_are_truncated() {
        let parsed = parse_action_output("Action: click(start_box='[1, 2, 3, 4, 5, 6]')");
        assert_eq!(parsed.record.start_box, Some([1, 2, 3, 4]));
    }

    #[test]
    fn recovers_call_with_unescaped_apostrophe() {
        let bare = parse_action_output("Now I type it: type(content='I'm here')");
        assert_eq!(bare.record.action, ActionKind::Type);
        assert_eq!(bare.record.content.as_deref(), Some("I'm here"));
        assert!(!bare.is_degraded());

        let marked = parse_action_output(
            "Thought: answer the chat\nAction: type(content='I'm on my way')\nThe field (top) is focused.",
        );
        assert_eq!(marked.record.action, ActionKind::Type);
        assert_eq!(marked.record.content.as_deref(), Some("I'm on my way"));
        assert_eq!(marked.record.thought, "answer the chat");
    }
}
