//! Integration tests for whole sessions
//!
//! The cognitive loop runs against the `conduit-echo-tool` endpoint with
//! scripted perception and decision collaborators:
//! - A multi-step session completes and its memory survives a restart
//! - Ollama-backed collaborators driven through a mock server
//! - Step budget and loop detection bounds, as properties

use async_trait::async_trait;
use proptest::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use conduit_engine::agent::{CognitiveLoop, LoopSettings, RetryPolicy, SessionStatus};
use conduit_engine::config::{EndpointConfig, ScopeConfig};
use conduit_engine::db::Database;
use conduit_engine::decision::{Decider, Decision, DecisionContext, LlmDecider};
use conduit_engine::llm::OllamaGenerator;
use conduit_engine::memory::{HashingEmbedder, MemoryStore, RecordKind};
use conduit_engine::perception::{
    LlmPerceiver, Perceiver, Perception, PerceptionRequest, ScopeRules,
};
use conduit_engine::tools::ToolRegistry;
use sdk::errors::EngineError;
use sdk::types::ToolCall;

const ECHO_TOOL: &str = env!("CARGO_BIN_EXE_conduit-echo-tool");
const DIMENSION: usize = 128;

struct PlainPerceiver;

#[async_trait]
impl Perceiver for PlainPerceiver {
    async fn perceive(&self, request: &PerceptionRequest) -> Result<Perception, EngineError> {
        Ok(Perception {
            intent: Some(request.query.clone()),
            ..Perception::default()
        })
    }
}

/// Adds 1 to the previous result until it reaches `target`
struct Counter {
    target: f64,
}

#[async_trait]
impl Decider for Counter {
    async fn decide(&self, context: &DecisionContext<'_>) -> Result<Decision, EngineError> {
        let current = context
            .history
            .last()
            .and_then(|s| s.result.value.as_f64())
            .unwrap_or(0.0);
        if current >= self.target {
            return Ok(Decision::FinalAnswer(format!("Counted to {}", current)));
        }
        Ok(Decision::ToolCall(ToolCall::new(
            "add",
            json!({"a": current, "b": 1}),
        )))
    }
}

/// Proposes a fresh echo call every time
struct Endless {
    calls: AtomicUsize,
}

#[async_trait]
impl Decider for Endless {
    async fn decide(&self, _context: &DecisionContext<'_>) -> Result<Decision, EngineError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Decision::ToolCall(ToolCall::new("echo", json!({"n": n}))))
    }
}

/// Proposes the same echo call every time
struct Stubborn;

#[async_trait]
impl Decider for Stubborn {
    async fn decide(&self, _context: &DecisionContext<'_>) -> Result<Decision, EngineError> {
        Ok(Decision::ToolCall(ToolCall::new("echo", json!({"text": "again"}))))
    }
}

fn settings(max_steps: usize) -> LoopSettings {
    LoopSettings {
        max_steps,
        loop_window: 3,
        max_consecutive_failures: 3,
        top_k: 3,
        llm_timeout: Duration::from_secs(10),
        retry: RetryPolicy::none(),
    }
}

async fn echo_registry() -> Arc<ToolRegistry> {
    Arc::new(
        ToolRegistry::initialize(&[EndpointConfig::local("echo", ECHO_TOOL, Vec::new())])
            .await
            .unwrap(),
    )
}

fn in_memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::in_memory(
        Arc::new(HashingEmbedder::new(DIMENSION)),
        DIMENSION,
    ))
}

#[tokio::test]
async fn test_session_completes_and_memory_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("memory.db");
    let registry = echo_registry().await;

    let session_id = {
        let db = Database::new(&db_path).await.unwrap();
        let memory = Arc::new(
            MemoryStore::open(db.memory(), Arc::new(HashingEmbedder::new(DIMENSION)), DIMENSION)
                .await
                .unwrap(),
        );
        let agent = CognitiveLoop::new(
            registry.clone(),
            memory.clone(),
            Arc::new(PlainPerceiver),
            Arc::new(Counter { target: 3.0 }),
            settings(10),
        );

        let outcome = agent.run("count to three", CancellationToken::new()).await;
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.steps, 3);
        assert_eq!(outcome.answer, "Counted to 3");
        assert!(outcome.history.iter().all(|s| s.endpoint.as_deref() == Some("echo")));

        db.close().await.unwrap();
        outcome.session_id
    };

    let db = Database::new(&db_path).await.unwrap();
    let reopened = MemoryStore::open(db.memory(), Arc::new(HashingEmbedder::new(DIMENSION)), DIMENSION)
        .await
        .unwrap();

    let records = reopened.session_records(&session_id).await;
    let tool_outputs = records.iter().filter(|r| r.kind == RecordKind::ToolOutput).count();
    let finals: Vec<_> = records.iter().filter(|r| r.kind == RecordKind::FinalAnswer).collect();
    assert_eq!(tool_outputs, 3);
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].text, "Counted to 3");

    let hits = reopened
        .query("count to three", 2, Some(RecordKind::ToolOutput))
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_ollama_collaborators_drive_a_session() {
    let server = MockServer::start().await;

    // Perception prompts and decision prompts share the endpoint; answer
    // with a perception JSON object first, then a plan, then the answer.
    let replies = Arc::new(AtomicUsize::new(0));
    let counter = replies.clone();
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(move |_: &wiremock::Request| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let response = match n {
                0 | 2 => r#"{"intent": "echo text", "entities": ["hello"], "tool_hint": "echo"}"#,
                1 => "FUNCTION_CALL: echo|text=\"hello\"",
                _ => "FINAL_ANSWER: echoed hello",
            };
            ResponseTemplate::new(200).set_body_json(json!({ "response": response }))
        })
        .mount(&server)
        .await;

    let registry = echo_registry().await;
    let generator = Arc::new(
        OllamaGenerator::new(server.uri(), "test-model", Duration::from_secs(5)).unwrap(),
    );
    let rules = ScopeRules::new(&ScopeConfig::default()).unwrap();
    let names = registry.tool_names().into_iter().map(str::to_string).collect();
    let perceiver = LlmPerceiver::new(generator.clone(), rules).with_tools(names, registry.describe_tools());

    let agent = CognitiveLoop::new(
        registry.clone(),
        in_memory_store(),
        Arc::new(perceiver),
        Arc::new(LlmDecider::new(generator)),
        settings(5),
    );

    let outcome = agent.run("echo hello", CancellationToken::new()).await;

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.answer, "echoed hello");
    assert_eq!(outcome.steps, 1);
    assert_eq!(outcome.history[0].result.value, json!({"text": "hello"}));

    registry.shutdown().await;
}

fn run_session(decider: Arc<dyn Decider>, max_steps: usize) -> (SessionStatus, usize, usize) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let registry = echo_registry().await;
        let memory = in_memory_store();
        let agent = CognitiveLoop::new(
            registry.clone(),
            memory.clone(),
            Arc::new(PlainPerceiver),
            decider,
            settings(max_steps),
        );
        let outcome = agent.run("keep going", CancellationToken::new()).await;
        let finals = memory
            .session_records(&outcome.session_id)
            .await
            .iter()
            .filter(|r| r.kind == RecordKind::FinalAnswer)
            .count();
        registry.shutdown().await;
        (outcome.status, outcome.steps, finals)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn test_step_count_never_exceeds_budget(max_steps in 1usize..6) {
        let decider = Arc::new(Endless { calls: AtomicUsize::new(0) });
        let (status, steps, finals) = run_session(decider, max_steps);

        prop_assert_eq!(status, SessionStatus::Incomplete);
        prop_assert_eq!(steps, max_steps);
        prop_assert_eq!(finals, 1);
    }

    #[test]
    fn test_repeated_call_terminates(max_steps in 2usize..20) {
        let (status, steps, finals) = run_session(Arc::new(Stubborn), max_steps);

        prop_assert_eq!(status, SessionStatus::Stuck);
        prop_assert_eq!(steps, 1);
        prop_assert_eq!(finals, 1);
    }
}

