// Conduit echo tool endpoint
// A small local endpoint speaking the line-delimited stdio protocol.

use async_trait::async_trait;
use sdk::{serve_stdio, EngineError, ToolHandler, ToolSet, ToolSpec};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Returns its arguments unchanged
struct Echo;

#[async_trait]
impl ToolHandler for Echo {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "echo",
            "Return the given arguments unchanged",
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } }
            }),
        )
    }

    async fn call(&self, arguments: Value) -> Result<Value, EngineError> {
        Ok(arguments)
    }
}

/// Sums two numbers
struct Add;

#[async_trait]
impl ToolHandler for Add {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "add",
            "Add two numbers",
            json!({
                "type": "object",
                "properties": {
                    "a": { "type": "number" },
                    "b": { "type": "number" }
                },
                "required": ["a", "b"]
            }),
        )
    }

    async fn call(&self, arguments: Value) -> Result<Value, EngineError> {
        let a = arguments["a"].as_f64();
        let b = arguments["b"].as_f64();
        match (a, b) {
            (Some(a), Some(b)) => Ok(json!(a + b)),
            _ => Err(EngineError::InvalidArguments {
                tool: "add".to_string(),
                reason: "a and b must be numbers".to_string(),
            }),
        }
    }
}

/// Waits before answering
struct Sleep;

#[async_trait]
impl ToolHandler for Sleep {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "sleep",
            "Wait for ms milliseconds",
            json!({
                "type": "object",
                "properties": { "ms": { "type": "integer" } },
                "required": ["ms"]
            }),
        )
    }

    async fn call(&self, arguments: Value) -> Result<Value, EngineError> {
        let ms = arguments["ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!({ "slept_ms": ms }))
    }
}

/// Exits the process mid-call
struct Crash;

#[async_trait]
impl ToolHandler for Crash {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("crash", "Terminate the endpoint", json!({ "type": "object" }))
    }

    async fn call(&self, _arguments: Value) -> Result<Value, EngineError> {
        std::process::exit(3)
    }
}

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    let tools = ToolSet::new()
        .with(Arc::new(Echo))
        .with(Arc::new(Add))
        .with(Arc::new(Sleep))
        .with(Arc::new(Crash));
    serve_stdio(&tools).await
}
