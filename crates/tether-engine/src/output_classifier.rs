//! Heuristic output classifier (§4.1): turns a raw PTY chunk into a
//! `ParsedEvent`. Matching happens on the ANSI-stripped text; the raw
//! bytes the caller renders are never touched here.
//!
//! `tool_end` is part of the closed `ParsedEvent` set for wire
//! compatibility but this classifier has no rule that produces it — the
//! spec gives tool-start a trigger and says nothing about how a tool
//! finishing would be recognized from a raw PTY stream.

use regex::Regex;
use std::sync::OnceLock;
use tether_core::types::{AskOption, ParsedEvent};

static ANSI_RE: OnceLock<Regex> = OnceLock::new();
static NUMBERED_LINE_RE: OnceLock<Regex> = OnceLock::new();
static TOOL_NAME_RE: OnceLock<Regex> = OnceLock::new();

fn ansi_re() -> &'static Regex {
    ANSI_RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").unwrap())
}

fn numbered_line_re() -> &'static Regex {
    NUMBERED_LINE_RE.get_or_init(|| Regex::new(r"(?m)^(\d+)\.\s+(.+)$").unwrap())
}

fn tool_name_re() -> &'static Regex {
    TOOL_NAME_RE.get_or_init(|| Regex::new(r"\b(Read|Edit|Write|Bash|Glob|Grep)\b").unwrap())
}

pub fn strip_ansi(raw: &str) -> String {
    ansi_re().replace_all(raw, "").into_owned()
}

/// Classify a chunk of PTY output. `raw` should already be lossily
/// decoded to UTF-8; callers keep the original bytes for rendering.
pub fn classify(raw: &str) -> ParsedEvent {
    let stripped = strip_ansi(raw);

    if stripped.contains('?') {
        let matches: Vec<_> = numbered_line_re().captures_iter(&stripped).collect();
        if matches.len() >= 2 {
            let options = matches
                .into_iter()
                .map(|c| {
                    let value = c[1].to_string();
                    let label = c[2].trim().to_string();
                    AskOption { label, value }
                })
                .collect();
            return ParsedEvent::AskUser { options };
        }
    }

    if let Some(m) = tool_name_re().find(&stripped) {
        return ParsedEvent::ToolStart {
            tool_name: m.as_str().to_string(),
        };
    }

    if stripped.contains("@@") && (stripped.contains('+') || stripped.contains('-')) {
        return ParsedEvent::Diff;
    }

    ParsedEvent::Text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ansi_escape_codes() {
        let raw = "\x1b[31mhello\x1b[0m world";
        assert_eq!(strip_ansi(raw), "hello world");
    }

    #[test]
    fn recognizes_ask_user_from_numbered_options() {
        let raw = "Which do you want?\n1. Apply patch\n2. Skip\n";
        match classify(raw) {
            ParsedEvent::AskUser { options } => {
                assert_eq!(options.len(), 2);
                assert_eq!(options[0].value, "1");
                assert_eq!(options[0].label, "Apply patch");
            }
            other => panic!("expected ask_user, got {other:?}"),
        }
    }

    #[test]
    fn recognizes_tool_start_and_captures_name() {
        let raw = "Running Bash(ls -la)...";
        match classify(raw) {
            ParsedEvent::ToolStart { tool_name } => assert_eq!(tool_name, "Bash"),
            other => panic!("expected tool_start, got {other:?}"),
        }
    }

    #[test]
    fn recognizes_diff_hunks() {
        let raw = "@@ -1,3 +1,4 @@\n+added line\n context\n";
        assert!(matches!(classify(raw), ParsedEvent::Diff));
    }

    #[test]
    fn falls_back_to_text() {
        let raw = "just some ordinary output\n";
        assert!(matches!(classify(raw), ParsedEvent::Text));
    }

    #[test]
    fn question_mark_alone_is_not_ask_user() {
        let raw = "Did that work?\n";
        assert!(matches!(classify(raw), ParsedEvent::Text));
    }
}
