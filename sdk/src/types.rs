//! Tool-facing and wire-level types
//!
//! These types are shared by the engine and by tool endpoints. `ToolSpec`,
//! `ToolCall` and `ToolResult` are the dispatcher's vocabulary; the
//! `Local*` frames are the line-delimited JSON protocol spoken over a local
//! endpoint's stdin/stdout.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::errors::EngineError;

/// Description of one callable operation exposed by an endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSpec {
    /// Unique name across all configured endpoints
    pub name: String,

    /// Human-readable description, shown to the decision model
    #[serde(default)]
    pub description: String,

    /// JSON schema of the arguments object
    #[serde(rename = "inputSchema", alias = "input_schema", default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

impl ToolSpec {
    /// Create a new tool spec
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }

    /// Property names declared by the schema, in declaration order
    pub fn property_names(&self) -> Vec<&str> {
        self.input_schema
            .get("properties")
            .and_then(|p| p.as_object())
            .map(|props| props.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

/// A request to execute one tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Name of the tool to call
    pub name: String,

    /// Arguments object
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    /// Create a new tool call
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    /// Canonical `name(args)` form with object keys sorted.
    ///
    /// Two calls with the same name and structurally equal arguments produce
    /// the same signature regardless of key order.
    pub fn signature(&self) -> String {
        format!("{}({})", self.name, canonical_json(&self.arguments))
    }
}

impl fmt::Display for ToolCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.arguments)
    }
}

/// Serialize a value with every object's keys in sorted order
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        Value::String(k.clone()),
                        canonical_json(&map[k.as_str()])
                    )
                })
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

/// Category of a failed tool call
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransportUnavailable,
    Timeout,
    MalformedResponse,
    ToolNotFound,
    InvalidArguments,
    ToolFailed,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransportUnavailable => "transport_unavailable",
            FailureKind::Timeout => "timeout",
            FailureKind::MalformedResponse => "malformed_response",
            FailureKind::ToolNotFound => "tool_not_found",
            FailureKind::InvalidArguments => "invalid_arguments",
            FailureKind::ToolFailed => "tool_failed",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error half of a `ToolResult`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ToolFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&EngineError> for ToolFailure {
    fn from(err: &EngineError) -> Self {
        let kind = match err {
            EngineError::TransportUnavailable(_) => FailureKind::TransportUnavailable,
            EngineError::Timeout(_) => FailureKind::Timeout,
            EngineError::MalformedResponse(_) => FailureKind::MalformedResponse,
            EngineError::ToolNotFound(_) => FailureKind::ToolNotFound,
            EngineError::InvalidArguments { .. } => FailureKind::InvalidArguments,
            EngineError::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::ToolFailed,
        };
        Self::new(kind, err.to_string())
    }
}

/// Outcome of exactly one adapter call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub success: bool,

    #[serde(default)]
    pub value: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolFailure>,
}

impl ToolResult {
    /// Create a successful result
    pub fn ok(value: Value) -> Self {
        Self {
            success: true,
            value,
            error: None,
        }
    }

    /// Create a failed result
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            value: Value::Null,
            error: Some(ToolFailure::new(kind, message)),
        }
    }

    /// Kind of failure, if any
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Text form of the payload, strings unquoted
    pub fn text(&self) -> String {
        match (&self.error, &self.value) {
            (Some(err), _) => format!("[{}] {}", err.kind, err.message),
            (None, Value::String(s)) => s.clone(),
            (None, Value::Null) => String::new(),
            (None, other) => other.to_string(),
        }
    }
}

impl From<EngineError> for ToolResult {
    fn from(err: EngineError) -> Self {
        let failure = ToolFailure::from(&err);
        Self {
            success: false,
            value: Value::Null,
            error: Some(failure),
        }
    }
}

/// `{tools: [...]}` envelope returned by discovery
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolList {
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

/// Method of a local endpoint request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LocalMethod {
    ListTools,
    CallTool,
}

/// `params` of a `call_tool` request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// One request line written to a local endpoint's stdin
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalRequest {
    pub id: u64,
    pub method: LocalMethod,
    #[serde(default)]
    pub params: Value,
}

impl LocalRequest {
    pub fn list_tools(id: u64) -> Self {
        Self {
            id,
            method: LocalMethod::ListTools,
            params: Value::Null,
        }
    }

    pub fn call_tool(id: u64, name: &str, arguments: Value) -> Self {
        Self {
            id,
            method: LocalMethod::CallTool,
            params: serde_json::json!({ "name": name, "arguments": arguments }),
        }
    }
}

/// One response line read from a local endpoint's stdout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LocalResponse {
    pub fn result(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(message.into()),
        }
    }
}
