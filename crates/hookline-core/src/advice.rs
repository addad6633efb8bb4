//! Advice items, candidate ranking, the quick path, and the actionability
//! rule.
//!
//! Every emitted item must contain at least one backtick-delimited command
//! span so the assistant has something concrete to run. Items without one
//! get a `Next check:` line built from a per-tool template.

use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Prefix of the appended actionability line.
pub const NEXT_STEP_PREFIX: &str = "Next check:";

/// Confidence assigned to quick-path advice.
pub const QUICK_CONFIDENCE: f64 = 0.35;

/// A backtick-delimited command span of at least two characters.
static COMMAND_SPAN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`[^`\n]{2,}`").unwrap());

/// Where an advice item came from. Lower rank wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviceSource {
    Packet,
    Live,
    Quick,
}

impl AdviceSource {
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Packet => 0,
            Self::Live => 1,
            Self::Quick => 2,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Packet => "packet",
            Self::Live => "live",
            Self::Quick => "quick",
        }
    }
}

/// One candidate piece of guidance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdviceItem {
    pub text: String,
    pub confidence: f64,
    pub source: AdviceSource,
    /// Stable identity of the underlying insight.
    pub insight_key: String,
}

impl AdviceItem {
    pub fn new(
        text: impl Into<String>,
        confidence: f64,
        source: AdviceSource,
        insight_key: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            confidence,
            source,
            insight_key: insight_key.into(),
        }
    }

    /// Copy of this item with different text.
    #[must_use]
    pub fn with_text(&self, text: String) -> Self {
        Self {
            text,
            ..self.clone()
        }
    }
}

/// Ordering used to pick the best candidate: source priority, then
/// confidence descending, then insight key ascending.
#[must_use]
pub fn candidate_order(a: &AdviceItem, b: &AdviceItem) -> Ordering {
    a.source
        .rank()
        .cmp(&b.source.rank())
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.insight_key.cmp(&b.insight_key))
}

/// Best candidate among `items`, if any.
#[must_use]
pub fn best_candidate(items: &[AdviceItem]) -> Option<&AdviceItem> {
    items.iter().min_by(|a, b| candidate_order(a, b))
}

/// Whether `text` already carries a runnable command span.
#[must_use]
pub fn has_next_step_command(text: &str) -> bool {
    COMMAND_SPAN.is_match(text)
}

/// Per-tool follow-up command used when advice has none.
#[must_use]
pub fn next_step_command(tool_name: &str) -> &'static str {
    match tool_name {
        "Edit" | "Write" | "MultiEdit" | "NotebookEdit" => "git diff --stat",
        "Read" | "Glob" | "Grep" | "LS" => "rg --files | head -50",
        "Task" => "git log --oneline -5",
        _ => "git status --short",
    }
}

/// Ensure the item carries a command span.
///
/// With `action_first` the line holding the command is moved to the top.
#[must_use]
pub fn enforce_actionability(item: &AdviceItem, tool_name: &str, action_first: bool) -> AdviceItem {
    let text = if has_next_step_command(&item.text) {
        item.text.clone()
    } else {
        let line = format!("{NEXT_STEP_PREFIX} `{}`", next_step_command(tool_name));
        let body = item.text.trim_end();
        if body.is_empty() {
            line
        } else {
            format!("{body}\n{line}")
        }
    };

    let text = if action_first {
        move_command_first(&text)
    } else {
        text
    };
    item.with_text(text)
}

/// Move the first line containing a command span to the front.
#[must_use]
pub fn move_command_first(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let Some(idx) = lines.iter().position(|l| COMMAND_SPAN.is_match(l)) else {
        return text.to_string();
    };
    if idx == 0 {
        return text.to_string();
    }
    let mut reordered = Vec::with_capacity(lines.len());
    reordered.push(lines[idx]);
    reordered.extend(
        lines
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .map(|(_, l)| *l),
    );
    reordered.join("\n")
}

/// Deterministic, cheap advice for a tool call. Never blocks.
#[must_use]
pub fn quick_advice(tool_name: &str, tool_input: &serde_json::Value) -> AdviceItem {
    let target = tool_input
        .get("file_path")
        .or_else(|| tool_input.get("path"))
        .and_then(serde_json::Value::as_str);

    let text = match (tool_name, target) {
        ("Bash", _) => {
            let risky = tool_input
                .get("command")
                .and_then(serde_json::Value::as_str)
                .is_some_and(|cmd| cmd.contains("rm -") || cmd.contains("--force"));
            if risky {
                "Destructive flags in this command; confirm the target paths first.".to_string()
            } else {
                "Check the exit status and stderr before relying on this output.".to_string()
            }
        }
        ("Edit" | "Write" | "MultiEdit" | "NotebookEdit", Some(path)) => {
            format!("Re-read {path} after editing; confirm only the intended hunk changed.")
        }
        ("Edit" | "Write" | "MultiEdit" | "NotebookEdit", None) => {
            "Confirm only the intended hunk changed after this edit.".to_string()
        }
        ("Read" | "Glob" | "Grep" | "LS", _) => {
            "Narrow the search before reading large files.".to_string()
        }
        _ => format!("Verify the result of {tool_name} before moving on."),
    };

    AdviceItem::new(text, QUICK_CONFIDENCE, AdviceSource::Quick, format!("quick:{tool_name}"))
}

/// Lowercased, whitespace-collapsed form used for dedupe.
#[must_use]
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Dedupe key for advice text: `text:<first 16 hex of sha256>`.
#[must_use]
pub fn text_key(text: &str) -> String {
    let digest = Sha256::digest(normalize_text(text).as_bytes());
    let hex = hex::encode(digest);
    format!("text:{}", &hex[..16])
}

/// Cooldown key for a tool: `tool:<name>`.
#[must_use]
pub fn tool_key(tool_name: &str) -> String {
    format!("tool:{tool_name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(source: AdviceSource, confidence: f64, key: &str) -> AdviceItem {
        AdviceItem::new("x", confidence, source, key)
    }

    #[test]
    fn ranking_prefers_source_then_confidence_then_key() {
        let items = vec![
            item(AdviceSource::Quick, 0.99, "a"),
            item(AdviceSource::Live, 0.5, "z"),
            item(AdviceSource::Live, 0.9, "y"),
            item(AdviceSource::Live, 0.9, "b"),
        ];
        let best = best_candidate(&items).unwrap();
        assert_eq!(best.source, AdviceSource::Live);
        assert_eq!(best.insight_key, "b");

        let with_packet = [items, vec![item(AdviceSource::Packet, 0.1, "p")]].concat();
        assert_eq!(best_candidate(&with_packet).unwrap().insight_key, "p");
        assert!(best_candidate(&[]).is_none());
    }

    #[test]
    fn command_span_detection() {
        assert!(has_next_step_command("run `cargo test` now"));
        assert!(!has_next_step_command("no command here"));
        assert!(!has_next_step_command("single `x` char"));
        assert!(!has_next_step_command("split `across\nlines`"));
    }

    #[test]
    fn actionability_appends_tool_template() {
        let base = AdviceItem::new("Watch for flaky tests.", 0.8, AdviceSource::Live, "k");
        let out = enforce_actionability(&base, "Edit", false);
        assert!(has_next_step_command(&out.text));
        assert!(out.text.ends_with("Next check: `git diff --stat`"));
        assert_eq!(out.insight_key, "k");
        // Original untouched.
        assert_eq!(base.text, "Watch for flaky tests.");
    }

    #[test]
    fn actionability_keeps_existing_command() {
        let base = AdviceItem::new("Run `cargo check` first.", 0.8, AdviceSource::Live, "k");
        assert_eq!(enforce_actionability(&base, "Bash", false).text, base.text);
    }

    #[test]
    fn action_first_moves_command_line_up() {
        let base = AdviceItem::new("Line one.\nLine two.", 0.8, AdviceSource::Live, "k");
        let out = enforce_actionability(&base, "Bash", true);
        let first = out.text.lines().next().unwrap();
        assert_eq!(first, "Next check: `git status --short`");
        assert_eq!(out.text.lines().count(), 3);

        let existing = "context\nthen `make lint`\nmore";
        assert_eq!(move_command_first(existing), "then `make lint`\ncontext\nmore");
    }

    #[test]
    fn quick_advice_is_deterministic() {
        let input = json!({ "command": "rm -rf build" });
        let a = quick_advice("Bash", &input);
        let b = quick_advice("Bash", &input);
        assert_eq!(a, b);
        assert_eq!(a.source, AdviceSource::Quick);
        assert_eq!(a.insight_key, "quick:Bash");
        assert!(a.text.contains("Destructive"));

        let edit = quick_advice("Edit", &json!({ "file_path": "src/lib.rs" }));
        assert!(edit.text.contains("src/lib.rs"));
    }

    #[test]
    fn text_key_ignores_case_and_spacing() {
        assert_eq!(text_key("Check  the LOG"), text_key("check the log"));
        assert_ne!(text_key("check the log"), text_key("check the logs"));
        assert!(text_key("a").starts_with("text:"));
        assert_eq!(text_key("a").len(), "text:".len() + 16);
    }
}
