//! Text generation layer
//!
//! Perception and decision both talk to a text-generation service through
//! the `TextGenerator` trait. `OllamaGenerator` is the only backend; tests
//! plug in scripted generators.
//!
//! The JSON helpers here pull a structured object out of model replies that
//! wrap it in code fences or surrounding prose.

use async_trait::async_trait;
use sdk::errors::EngineError;
use serde_json::Value;

pub mod ollama;

pub use ollama::OllamaGenerator;

/// Result type for LLM operations
pub type Result<T> = std::result::Result<T, LLMError>;

/// Errors that can occur during LLM operations
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Empty response")]
    EmptyResponse,
}

impl LLMError {
    /// Wrap as a perception failure
    pub fn into_perception(self) -> EngineError {
        EngineError::PerceptionFailure(self.to_string())
    }

    /// Wrap as a decision failure
    pub fn into_decision(self) -> EngineError {
        EngineError::DecisionFailure(self.to_string())
    }
}

/// A text-generation backend
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Returns the name of the backend (e.g., "ollama")
    fn name(&self) -> &str;

    /// Complete a single prompt and return the raw text reply
    async fn generate(&self, prompt: &str) -> Result<String>;
}

/// Find the first JSON object in a model reply.
///
/// Tries, in order: the whole reply, the body of the first code fence, and
/// the first balanced `{...}` span in the text.
pub fn extract_json_object(content: &str) -> Option<Value> {
    let trimmed = content.trim();

    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if let Some(inner) = extract_fenced_json(trimmed) {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(inner.trim()) {
            return Some(value);
        }
    }

    let mut rest = trimmed;
    while let Some(pos) = rest.find('{') {
        let candidate = &rest[pos..];
        if let Some(json_str) = extract_balanced(candidate, '{', '}') {
            if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(json_str) {
                return Some(value);
            }
        }
        rest = &candidate[1..];
    }

    None
}

/// Extract the body of the first markdown code fence in the text.
///
/// Works even when there is trailing prose after the closing ```.
pub fn extract_fenced_json(content: &str) -> Option<&str> {
    let fence_start = content.find("```")?;
    let after_opening = &content[fence_start + 3..];

    // Skip the language tag line (e.g. "json\n")
    let body_start_rel = after_opening.find('\n')? + 1;
    let body_start = fence_start + 3 + body_start_rel;

    let closing = content[body_start..].find("```")?;
    let body_end = body_start + closing;

    if body_start >= body_end {
        return None;
    }

    Some(&content[body_start..body_end])
}

/// Extract a balanced span starting at position 0 of `s`.
///
/// Counts `open` / `close` depth, respecting string literals, to find the
/// matching close delimiter.
pub fn extract_balanced(s: &str, open: char, close: char) -> Option<&str> {
    if !s.starts_with(open) {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
