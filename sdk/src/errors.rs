//! Error types and handling
//!
//! This module provides the error taxonomy shared by the Conduit engine and
//! tool endpoints. All errors implement the `ErrorExt` trait which provides
//! user-facing hints and tells the cognitive loop whether a failure can be
//! re-planned around or must end the session.
//!
//! # Security
//!
//! Hints never echo the wrapped detail string, so endpoint output, file
//! paths and credentials stay out of user-visible answers.

use thiserror::Error;

/// Trait for Conduit error extensions
///
/// Provides user-friendly hints and recoverability information. All engine
/// errors implement this trait.
pub trait ErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and does not contain
    /// secrets, file paths or endpoint internals.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors are stored as session context and fed back into
    /// the next planning step. Non-recoverable errors terminate the session
    /// with a diagnostic answer.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Transport**: endpoint unavailable, deadline exceeded, unparseable reply
/// - **Dispatch**: unknown tool, argument validation, name collisions
/// - **Collaborators**: perception and decision failures after retries
/// - **Loop**: repeated calls and an exhausted step budget
/// - **Memory**: embedding, dimension and duplicate-id failures
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, ErrorExt};
///
/// let error = EngineError::ToolNotFound("search".to_string());
/// println!("Hint: {}", error.user_hint());
/// assert!(error.is_recoverable());
///
/// let fatal_error = EngineError::LoopDetected("search".to_string());
/// assert!(!fatal_error.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    // Transport errors
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    // Dispatch errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool '{tool}' is exposed by both '{first}' and '{second}'")]
    ToolNameCollision {
        tool: String,
        first: String,
        second: String,
    },

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Tool failed: {0}")]
    ToolFailed(String),

    // Collaborator errors
    #[error("Perception failed: {0}")]
    PerceptionFailure(String),

    #[error("Decision failed: {0}")]
    DecisionFailure(String),

    // Loop errors
    #[error("Loop detected: {0}")]
    LoopDetected(String),

    #[error("Step budget of {0} exhausted")]
    StepBudgetExhausted(usize),

    #[error("Session cancelled")]
    Cancelled,

    // Memory errors
    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Duplicate memory record: {0}")]
    DuplicateRecord(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Database(_) => "Memory database operation failed. Check the data directory",

            Self::TransportUnavailable(_) => "A tool endpoint is not reachable",
            Self::Timeout(_) => "A tool or model took too long to respond",
            Self::MalformedResponse(_) => "A tool endpoint returned an unreadable response",

            Self::ToolNotFound(_) => "The requested tool is not available",
            Self::ToolNameCollision { .. } => "Two endpoints expose the same tool name",
            Self::InvalidArguments { .. } => "The tool was called with invalid arguments",
            Self::ToolFailed(_) => "Tool operation failed",

            Self::PerceptionFailure(_) => "Could not understand the request",
            Self::DecisionFailure(_) => "Could not plan the next step",

            Self::LoopDetected(_) => "The agent kept repeating the same step and was stopped",
            Self::StepBudgetExhausted(_) => {
                "Task too complex for the step limit. Try breaking it into smaller steps"
            }
            Self::Cancelled => "The task was cancelled",

            Self::Embedding(_) => "Embedding service unavailable",
            Self::DimensionMismatch { .. } => "Embedding model does not match the memory index",
            Self::DuplicateRecord(_) => "Memory record already exists",

            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_)
            | Self::ToolNameCollision { .. }
            | Self::PerceptionFailure(_)
            | Self::DecisionFailure(_)
            | Self::LoopDetected(_)
            | Self::StepBudgetExhausted(_)
            | Self::Cancelled
            | Self::DimensionMismatch { .. } => false,

            _ => true,
        }
    }
}
