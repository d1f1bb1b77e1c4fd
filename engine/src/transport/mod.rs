//! Transport adapters
//!
//! A transport wraps one tool endpoint and presents it through the uniform
//! [`ToolTransport`] surface. Two variants exist:
//!
//! - [`LocalTransport`]: a spawned subprocess exchanging one JSON frame per
//!   line over stdin/stdout. One subprocess channel carries one request at a
//!   time, so the dispatcher serializes calls to it.
//! - [`RemoteTransport`]: an HTTP service with `GET {base}/tools` and
//!   `POST {base}/call_tool`, called through a pooled client.
//!
//! Adapters never retry. Failures surface as [`TransportError`] and are
//! turned into failed `ToolResult`s by the dispatcher.

use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::types::{ToolResult, ToolSpec};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EndpointConfig, EndpointKind};

pub mod local;
pub mod remote;

pub use local::LocalTransport;
pub use remote::RemoteTransport;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors raised by a transport adapter
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The subprocess died or the connection was refused
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    Malformed(String),

    /// Non-success HTTP status during discovery
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable(msg) => EngineError::TransportUnavailable(msg),
            TransportError::Timeout(d) => EngineError::Timeout(d.as_millis() as u64),
            TransportError::Malformed(msg) => EngineError::MalformedResponse(msg),
            status @ TransportError::Status { .. } => {
                EngineError::TransportUnavailable(status.to_string())
            }
        }
    }
}

/// Endpoint kind, for logs and the CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Local,
    Remote,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Local => write!(f, "local"),
            TransportKind::Remote => write!(f, "remote"),
        }
    }
}

/// Uniform call surface over one tool endpoint
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Configured endpoint id
    fn endpoint_id(&self) -> &str;

    fn kind(&self) -> TransportKind;

    /// Whether several calls may be in flight on this adapter at once
    fn supports_concurrent_calls(&self) -> bool;

    /// Discover the endpoint's tools.
    ///
    /// Idempotent; the first successful answer is cached for the adapter's
    /// lifetime.
    async fn list_tools(&self) -> Result<Vec<ToolSpec>>;

    /// Execute one tool.
    ///
    /// A tool that ran and reported an error is `Ok` with a failed
    /// `ToolResult`; `Err` means the endpoint itself could not answer.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult>;

    /// Release the subprocess or connection pool
    async fn shutdown(&self);
}

/// Build the adapter matching an endpoint definition
pub fn from_config(endpoint: &EndpointConfig) -> Result<Arc<dyn ToolTransport>> {
    match &endpoint.kind {
        EndpointKind::Local {
            command,
            args,
            cwd,
            env,
        } => {
            let mut transport =
                LocalTransport::new(&endpoint.id, command, args.clone(), endpoint.timeout());
            if let Some(dir) = cwd {
                transport = transport.with_cwd(dir.clone());
            }
            for (key, value) in env {
                transport = transport.with_env(key, value);
            }
            Ok(Arc::new(transport))
        }
        EndpointKind::Remote { base_url, api_key } => {
            let mut transport = RemoteTransport::new(&endpoint.id, base_url, endpoint.timeout())?;
            if let Some(key) = api_key {
                transport = transport.with_api_key(key);
            }
            Ok(Arc::new(transport))
        }
    }
}
