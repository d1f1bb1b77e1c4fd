//! Conduit Engine Library
//!
//! This library provides the core functionality of the Conduit engine.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Telemetry and Observability
pub mod telemetry;

/// Local and remote tool endpoint transports
pub mod transport;

/// Tool registry and dispatcher
pub mod tools;

/// Database persistence module
pub mod db;

/// Vector memory store
pub mod memory;

/// Text generation backends
pub mod llm;

/// Request perception
pub mod perception;

/// Next-step decision
pub mod decision;

/// Agent loop core module
pub mod agent;

/// Message intake
pub mod intake;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
