//! Conduit SDK
//!
//! Shared types for the Conduit engine and for tool endpoints written in
//! Rust: the tool vocabulary, the local endpoint wire frames, the error
//! taxonomy, and a stdio server helper.

/// Error types and handling
pub mod errors;

/// Tool and wire types
pub mod types;

/// Stdio tool server
pub mod server;

// Re-export commonly used types
pub use errors::{EngineError, ErrorExt};
pub use server::{serve, serve_stdio, ToolHandler, ToolSet};
pub use types::{
    CallParams, FailureKind, LocalMethod, LocalRequest, LocalResponse, ToolCall, ToolFailure,
    ToolList, ToolResult, ToolSpec,
};
