//! Agent Loop Core
//!
//! This module implements the cognitive loop that turns one user request
//! into a bounded sequence of tool calls. The loop perceives, retrieves
//! context from memory, decides, executes and terminates with one answer.

pub mod core;
pub mod retry;
pub mod session;

pub use core::{CognitiveLoop, LoopSettings};
pub use retry::RetryPolicy;
pub use session::{
    extract_artifacts, LoopPhase, SessionOutcome, SessionState, SessionStatus, Step,
};
