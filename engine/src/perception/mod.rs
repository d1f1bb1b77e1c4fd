//! Perception
//!
//! Turns a user query (plus what earlier steps produced) into a structured
//! reading: intent, entities, a tool hint and a result scope. The loop only
//! depends on the `Perceiver` trait; `LlmPerceiver` is the model-backed
//! implementation.

pub mod scope;

pub use scope::ScopeRules;

use async_trait::async_trait;
use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::llm::{extract_json_object, TextGenerator};

/// How the scope limit should be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    Top,
    Latest,
    All,
}

impl ScopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Top => "top",
            Self::Latest => "latest",
            Self::All => "all",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "top" => Some(Self::Top),
            "latest" | "recent" => Some(Self::Latest),
            "all" => Some(Self::All),
            _ => None,
        }
    }
}

impl fmt::Display for ScopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Perception {
    pub intent: Option<String>,
    pub entities: Vec<String>,
    pub scope_limit: Option<u32>,
    pub scope_type: Option<ScopeType>,
    pub tool_hint: Option<String>,
}

impl Perception {
    /// One-line rendering for prompts and memory
    pub fn summary(&self) -> String {
        let scope = match (self.scope_limit, self.scope_type) {
            (Some(n), Some(t)) => format!("{} {}", t, n),
            (Some(n), None) => format!("top {}", n),
            _ => "no limit".to_string(),
        };
        format!(
            "intent: {}; entities: [{}]; tool hint: {}; scope: {}",
            self.intent.as_deref().unwrap_or("unspecified"),
            self.entities.join(", "),
            self.tool_hint.as_deref().unwrap_or("none"),
            scope
        )
    }
}

/// What perception sees each iteration
#[derive(Debug, Clone)]
pub struct PerceptionRequest {
    pub query: String,
    /// Short descriptions of earlier steps and their outcomes
    pub prior_steps: Vec<String>,
}

#[async_trait]
pub trait Perceiver: Send + Sync {
    async fn perceive(&self, request: &PerceptionRequest) -> Result<Perception, EngineError>;
}

/// Perceiver that asks a text generator for strict JSON
pub struct LlmPerceiver {
    generator: Arc<dyn TextGenerator>,
    rules: ScopeRules,
    tool_names: Vec<String>,
    tool_context: String,
}

impl LlmPerceiver {
    pub fn new(generator: Arc<dyn TextGenerator>, rules: ScopeRules) -> Self {
        Self {
            generator,
            rules,
            tool_names: Vec::new(),
            tool_context: String::new(),
        }
    }

    /// Registered tools: names for hint matching, description for the prompt
    pub fn with_tools(mut self, names: Vec<String>, description: impl Into<String>) -> Self {
        self.tool_names = names;
        self.tool_context = description.into();
        self
    }

    fn build_prompt(&self, request: &PerceptionRequest) -> String {
        let prior = if request.prior_steps.is_empty() {
            "None".to_string()
        } else {
            request
                .prior_steps
                .iter()
                .map(|s| format!("- {}", s))
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            r#"You extract structured facts from a user request.

Available tools:
{tools}

Earlier steps:
{prior}

Input: "{query}"

Return ONLY a JSON object, no markdown and no explanation:
{{"intent": "...", "entities": ["keyword1", "keyword2"], "tool_hint": "tool name or null", "scope_limit": number or null, "scope_type": "top" | "latest" | "all" | null}}

Example: {{"intent": "search for F1 standings", "entities": ["F1", "standings"], "tool_hint": "search", "scope_limit": null, "scope_type": null}}"#,
            tools = if self.tool_context.is_empty() {
                "(none listed)"
            } else {
                self.tool_context.as_str()
            },
            prior = prior,
            query = request.query,
        )
    }

    /// Name of a registered tool mentioned in the query
    fn hint_from_query(&self, query: &str) -> Option<String> {
        let lowered = query.to_lowercase();
        self.tool_names
            .iter()
            .find(|name| {
                let name = name.to_lowercase();
                lowered.contains(&name) || lowered.contains(&name.replace('_', " "))
            })
            .cloned()
    }
}

/// Read a perception out of a model reply
pub fn parse_perception(raw: &str) -> Result<Perception, EngineError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || ["none", "null", "undefined"].contains(&trimmed.to_lowercase().as_str())
    {
        return Err(EngineError::PerceptionFailure(
            "empty or null model output".to_string(),
        ));
    }

    let json = extract_json_object(trimmed).ok_or_else(|| {
        EngineError::PerceptionFailure(format!(
            "no JSON object in model output: {}",
            truncate(trimmed, 120)
        ))
    })?;

    Ok(Perception {
        intent: non_empty_string(json.get("intent")),
        entities: entities(json.get("entities")),
        scope_limit: json
            .get("scope_limit")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0),
        scope_type: json
            .get("scope_type")
            .and_then(|v| v.as_str())
            .and_then(ScopeType::parse),
        tool_hint: non_empty_string(json.get("tool_hint")),
    })
}

fn non_empty_string(value: Option<&Value>) -> Option<String> {
    let s = value?.as_str()?.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("null") || s.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(s.to_string())
    }
}

/// Entities may come back as a list, an object of named values or missing
fn entities(value: Option<&Value>) -> Vec<String> {
    let render = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match value {
        Some(Value::Array(items)) => items.iter().map(render).collect(),
        Some(Value::Object(map)) => map.values().map(render).collect(),
        _ => Vec::new(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}

#[async_trait]
impl Perceiver for LlmPerceiver {
    async fn perceive(&self, request: &PerceptionRequest) -> Result<Perception, EngineError> {
        let prompt = self.build_prompt(request);
        let raw = self
            .generator
            .generate(&prompt)
            .await
            .map_err(|e| e.into_perception())?;

        let mut perception = parse_perception(&raw)?;
        if perception.tool_hint.is_none() {
            perception.tool_hint = self.hint_from_query(&request.query);
        }
        self.rules.apply(&request.query, &mut perception);

        debug!(summary = %perception.summary(), "Perception parsed");
        Ok(perception)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScopeConfig;
    use crate::llm::{LLMError, Result as LlmResult};

    struct Canned(&'static str);

    #[async_trait]
    impl TextGenerator for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        async fn generate(&self, _prompt: &str) -> LlmResult<String> {
            Ok(self.0.to_string())
        }
    }

    struct Down;

    #[async_trait]
    impl TextGenerator for Down {
        fn name(&self) -> &str {
            "down"
        }

        async fn generate(&self, _prompt: &str) -> LlmResult<String> {
            Err(LLMError::Timeout)
        }
    }

    fn perceiver(generator: Arc<dyn TextGenerator>) -> LlmPerceiver {
        LlmPerceiver::new(generator, ScopeRules::new(&ScopeConfig::default()).unwrap())
            .with_tools(
                vec!["search".to_string(), "create_google_sheet".to_string()],
                "- search: web search",
            )
    }

    fn request(query: &str) -> PerceptionRequest {
        PerceptionRequest {
            query: query.to_string(),
            prior_steps: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_perceive_applies_scope_default() {
        let p = perceiver(Arc::new(Canned(
            "```json\n{\"intent\": \"standings lookup\", \"entities\": [\"F1\"], \"tool_hint\": \"search\"}\n```",
        )));
        let perception = p.perceive(&request("Find current standings")).await.unwrap();

        assert_eq!(perception.intent.as_deref(), Some("standings lookup"));
        assert_eq!(perception.scope_limit, Some(10));
        assert_eq!(perception.scope_type, Some(ScopeType::Top));
    }

    #[tokio::test]
    async fn test_tool_hint_falls_back_to_query() {
        let p = perceiver(Arc::new(Canned(r#"{"intent": "x", "tool_hint": null}"#)));
        let perception = p
            .perceive(&request("please create google sheet of top 20 teams"))
            .await
            .unwrap();

        assert_eq!(perception.tool_hint.as_deref(), Some("create_google_sheet"));
        assert_eq!(perception.scope_limit, Some(20));
    }

    #[tokio::test]
    async fn test_null_reply_is_failure() {
        let p = perceiver(Arc::new(Canned("null")));
        let err = p.perceive(&request("q")).await.unwrap_err();
        assert!(matches!(err, EngineError::PerceptionFailure(_)));
    }

    #[tokio::test]
    async fn test_generator_error_is_failure() {
        let p = perceiver(Arc::new(Down));
        let err = p.perceive(&request("q")).await.unwrap_err();
        assert!(matches!(err, EngineError::PerceptionFailure(msg) if msg.contains("Timeout")));
    }

    #[test]
    fn test_entities_from_object() {
        let p = parse_perception(r#"{"entities": {"sport": "F1", "year": 2024}}"#).unwrap();
        assert_eq!(p.entities.len(), 2);
        assert!(p.entities.contains(&"F1".to_string()));
        assert!(p.entities.contains(&"2024".to_string()));
    }

    #[test]
    fn test_scope_fields_are_read() {
        let p = parse_perception(r#"{"scope_limit": "5", "scope_type": "Latest"}"#).unwrap();
        assert_eq!(p.scope_limit, Some(5));
        assert_eq!(p.scope_type, Some(ScopeType::Latest));
    }

    #[test]
    fn test_summary() {
        let p = Perception {
            intent: Some("lookup".to_string()),
            entities: vec!["F1".to_string()],
            scope_limit: Some(10),
            scope_type: Some(ScopeType::Top),
            tool_hint: None,
        };
        assert_eq!(
            p.summary(),
            "intent: lookup; entities: [F1]; tool hint: none; scope: top 10"
        );
    }
}
