//! Decision
//!
//! Chooses the next step: one tool call, a batch of independent calls, or
//! the final answer. `LlmDecider` prompts a text generator and parses its
//! plan line (see `parse`).

pub mod parse;

pub use parse::{parse_decision, parse_function_call};

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::ToolCall;
use std::sync::Arc;
use tracing::debug;

use crate::agent::Step;
use crate::llm::TextGenerator;
use crate::memory::MemoryRecord;
use crate::perception::Perception;

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    ToolCall(ToolCall),
    /// Independent calls that may run concurrently
    Batch(Vec<ToolCall>),
    FinalAnswer(String),
}

/// Everything the decider may look at for one step
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    pub query: &'a str,
    /// 1-based number of the step being planned
    pub step: usize,
    pub max_steps: usize,
    pub perception: &'a Perception,
    pub retrieved: &'a [MemoryRecord],
    pub history: &'a [Step],
    /// Failure text of the previous step, if it failed
    pub last_failure: Option<&'a str>,
    pub tools: &'a str,
}

#[async_trait]
pub trait Decider: Send + Sync {
    async fn decide(&self, context: &DecisionContext<'_>) -> Result<Decision, EngineError>;
}

pub struct LlmDecider {
    generator: Arc<dyn TextGenerator>,
}

impl LlmDecider {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }

    pub fn build_prompt(context: &DecisionContext<'_>) -> String {
        let remaining = context.max_steps.saturating_sub(context.step) + 1;
        let perception = context.perception;

        let memory = if context.retrieved.is_empty() {
            "None".to_string()
        } else {
            context
                .retrieved
                .iter()
                .map(|r| match &r.tool_name {
                    Some(tool) => format!("- [{} from {}] {}", r.kind, tool, r.text),
                    None => format!("- [{}] {}", r.kind, r.text),
                })
                .collect::<Vec<_>>()
                .join("\n")
        };

        let history = if context.history.is_empty() {
            "None yet".to_string()
        } else {
            context
                .history
                .iter()
                .map(|s| format!("- {}", s.summary()))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let scope = match perception.scope_limit {
            Some(n) => format!(
                "{} {} (limit results to {})",
                perception.scope_type.map(|t| t.as_str()).unwrap_or("top"),
                n,
                n
            ),
            None => "no limit".to_string(),
        };

        let last_failure = context
            .last_failure
            .map(|f| {
                format!(
                    "\nThe previous step failed: {}\nChoose a different tool or different arguments.\n",
                    f
                )
            })
            .unwrap_or_default();

        let urgency = if remaining <= 2 {
            "\nOnly a few steps remain. Return FINAL_ANSWER as soon as the task is done or cannot be completed.\n"
        } else {
            ""
        };

        format!(
            r#"You are a reasoning agent that solves the user's request step by step using tools.

Step {step} of {max_steps} ({remaining} remaining).{urgency}
User request: "{query}"
- Intent: {intent}
- Entities: {entities}
- Tool hint: {hint}
- Scope: {scope}

Tools:
{tools}

Relevant memory:
{memory}

Steps so far:
{history}
{last_failure}
Respond with exactly one line in one of these formats:
FUNCTION_CALL: tool_name|param1=value1|nested.param=value2
FINAL_ANSWER: the actual answer for the user
BATCH: [{{"name": "tool_a", "arguments": {{...}}}}, {{"name": "tool_b", "arguments": {{...}}}}]   (only for independent calls)

Rules:
- Do not repeat a call that already appears in the steps above; use its result from memory.
- Values may be JSON (numbers, arrays, quoted strings).
- Never output explanations, only the single line."#,
            step = context.step,
            max_steps = context.max_steps,
            remaining = remaining,
            urgency = urgency,
            query = context.query,
            intent = perception.intent.as_deref().unwrap_or("not specified"),
            entities = if perception.entities.is_empty() {
                "none".to_string()
            } else {
                perception.entities.join(", ")
            },
            hint = perception.tool_hint.as_deref().unwrap_or("none"),
            scope = scope,
            tools = context.tools,
            memory = memory,
            history = history,
            last_failure = last_failure,
        )
    }
}

#[async_trait]
impl Decider for LlmDecider {
    async fn decide(&self, context: &DecisionContext<'_>) -> Result<Decision, EngineError> {
        let prompt = Self::build_prompt(context);
        let raw = self
            .generator
            .generate(&prompt)
            .await
            .map_err(|e| e.into_decision())?;

        debug!(step = context.step, output = %raw.trim(), "Decision model output");
        parse_decision(&raw)
    }
}
