//! Session state
//!
//! Everything one run of the cognitive loop owns: the step counter, the
//! ordered call history, the latest perception and the failure streak.
//! Nothing here is shared between sessions.

use regex::Regex;
use sdk::types::{ToolCall, ToolResult};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;
use tracing::debug;
use uuid::Uuid;

use crate::perception::Perception;

/// Phases of the cognitive loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Started,
    Perceiving,
    Retrieving,
    Deciding,
    Executing,
    Completing,
    Terminated,
}

impl fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Started => "started",
            Self::Perceiving => "perceiving",
            Self::Retrieving => "retrieving",
            Self::Deciding => "deciding",
            Self::Executing => "executing",
            Self::Completing => "completing",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// One executed tool call and its result
#[derive(Debug, Clone, Serialize)]
pub struct Step {
    /// 1-based position in the history
    pub index: usize,
    pub call: ToolCall,
    pub result: ToolResult,
    pub elapsed_ms: u64,
    pub endpoint: Option<String>,
}

impl Step {
    pub fn new(index: usize, call: ToolCall, result: ToolResult) -> Self {
        Self {
            index,
            call,
            result,
            elapsed_ms: 0,
            endpoint: None,
        }
    }

    /// `name(args) -> outcome`, shortened for prompts
    pub fn summary(&self) -> String {
        let outcome = if self.result.success {
            format!("ok: {}", truncate(&self.result.text(), 300))
        } else {
            format!("failed: {}", truncate(&self.result.text(), 300))
        };
        format!("{}. {} -> {}", self.index, self.call, outcome)
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// The decider produced a final answer
    Completed,
    /// The step budget ran out first
    Incomplete,
    /// A call was proposed again
    Stuck,
    /// Collaborators or tools failed beyond their limits
    Failed,
    Cancelled,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Completed => "completed",
            Self::Incomplete => "incomplete",
            Self::Stuck => "stuck",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Result of one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub session_id: String,
    pub status: SessionStatus,
    /// Always present, also on failure
    pub answer: String,
    /// Successful steps executed
    pub steps: usize,
    pub history: Vec<Step>,
    /// Links produced by tools during the session
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub original_query: String,
    pub step_count: usize,
    pub history: Vec<Step>,
    pub perception: Option<Perception>,
    pub phase: LoopPhase,
    pub terminal: bool,
    pub consecutive_failures: usize,
    pub last_failure: Option<String>,
}

impl SessionState {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            original_query: query.into(),
            step_count: 0,
            history: Vec::new(),
            perception: None,
            phase: LoopPhase::Started,
            terminal: false,
            consecutive_failures: 0,
            last_failure: None,
        }
    }

    pub fn advance(&mut self, phase: LoopPhase) {
        debug!(
            session_id = %self.session_id,
            from = %self.phase,
            to = %phase,
            step = self.step_count,
            "Phase transition"
        );
        self.phase = phase;
    }

    /// Append an executed call. Only successes count toward the step budget.
    pub fn record(&mut self, mut step: Step) {
        step.index = self.history.len() + 1;
        if step.result.success {
            self.step_count += 1;
            self.consecutive_failures = 0;
            self.last_failure = None;
        } else {
            self.consecutive_failures += 1;
            self.last_failure = Some(step.result.text());
        }
        self.history.push(step);
    }

    /// True when `call` matches one of the last `window` calls
    pub fn is_repeat(&self, call: &ToolCall, window: usize) -> bool {
        let signature = call.signature();
        self.history
            .iter()
            .rev()
            .take(window)
            .any(|s| s.call.signature() == signature)
    }

    pub fn prior_step_summaries(&self) -> Vec<String> {
        self.history.iter().map(Step::summary).collect()
    }

    /// Successful tool names in order, for progress reports
    pub fn completed_tools(&self) -> Vec<&str> {
        self.history
            .iter()
            .filter(|s| s.result.success)
            .map(|s| s.call.name.as_str())
            .collect()
    }

    /// URLs in successful tool results, first occurrence order
    pub fn artifacts(&self) -> Vec<String> {
        extract_artifacts(
            self.history
                .iter()
                .filter(|s| s.result.success)
                .map(|s| s.result.text()),
        )
    }
}

fn url_pattern() -> Option<&'static Regex> {
    static URL: OnceLock<Option<Regex>> = OnceLock::new();
    URL.get_or_init(|| Regex::new(r#"https?://[^\s"'<>\)\]\}]+"#).ok())
        .as_ref()
}

/// Collect distinct URLs from texts, keeping first-seen order
pub fn extract_artifacts<I, S>(texts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let Some(pattern) = url_pattern() else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut artifacts = Vec::new();
    for text in texts {
        for m in pattern.find_iter(text.as_ref()) {
            let url = m.as_str().trim_end_matches(['.', ',', ';', ':', '!', '?']);
            if seen.insert(url.to_string()) {
                artifacts.push(url.to_string());
            }
        }
    }
    artifacts
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdk::types::FailureKind;
    use serde_json::json;

    fn ok(name: &str, args: serde_json::Value, value: serde_json::Value) -> Step {
        Step::new(0, ToolCall::new(name, args), ToolResult::ok(value))
    }

    fn failed(name: &str) -> Step {
        Step::new(
            0,
            ToolCall::new(name, json!({})),
            ToolResult::failure(FailureKind::Timeout, "slow"),
        )
    }

    #[test]
    fn test_only_successes_count() {
        let mut state = SessionState::new("q");
        state.record(failed("a"));
        state.record(failed("b"));
        assert_eq!(state.step_count, 0);
        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.last_failure.as_deref(), Some("[timeout] slow"));

        state.record(ok("c", json!({}), json!(1)));
        assert_eq!(state.step_count, 1);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_failure.is_none());
        assert_eq!(state.history[2].index, 3);
    }

    #[test]
    fn test_repeat_ignores_key_order_and_respects_window() {
        let mut state = SessionState::new("q");
        state.record(ok("search", json!({"q": "f1", "n": 10}), json!("r")));
        state.record(ok("other", json!({}), json!("r")));

        let same = ToolCall::new("search", json!({"n": 10, "q": "f1"}));
        assert!(state.is_repeat(&same, 3));
        assert!(!state.is_repeat(&same, 1));
        assert!(!state.is_repeat(&ToolCall::new("search", json!({"q": "f2"})), 3));
    }

    #[test]
    fn test_artifacts_from_successful_results_only() {
        let mut state = SessionState::new("q");
        state.record(ok(
            "get_sheet_link",
            json!({}),
            json!({"link": "https://docs.example.com/sheet/1"}),
        ));
        state.record(ok(
            "note",
            json!({}),
            json!("see https://docs.example.com/sheet/1. and http://x.test/a"),
        ));
        state.record(Step::new(
            0,
            ToolCall::new("bad", json!({})),
            ToolResult::failure(FailureKind::ToolFailed, "https://err.test/ignored"),
        ));

        assert_eq!(
            state.artifacts(),
            vec!["https://docs.example.com/sheet/1", "http://x.test/a"]
        );
    }

    #[test]
    fn test_step_summary() {
        let step = Step::new(2, ToolCall::new("search", json!({"q": 1})), ToolResult::ok(json!("found")));
        assert_eq!(step.summary(), "2. search({\"q\":1}) -> ok: found");
    }
}
