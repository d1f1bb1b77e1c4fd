//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - run: Execute one session for a query
//! - tools: List the tools discovered on configured endpoints
//! - memory search: Nearest records in the memory store
//! - listen: Poll a message tool and run a session per message

use anyhow::{Context, Result};
use sdk::types::ToolCall;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{CognitiveLoop, LoopSettings, SessionOutcome, SessionStatus};
use crate::config::Config;
use crate::db::Database;
use crate::decision::LlmDecider;
use crate::intake::ToolPollSource;
use crate::llm::{OllamaGenerator, TextGenerator};
use crate::memory::{embedder_from_config, MemoryQuery, MemoryStore, RecordKind};
use crate::perception::{LlmPerceiver, ScopeRules};
use crate::tools::ToolRegistry;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Everything a session needs, assembled once per process
pub struct Runtime {
    pub registry: Arc<ToolRegistry>,
    pub memory: Arc<MemoryStore>,
    pub agent: CognitiveLoop,
    database: Option<Database>,
}

impl Runtime {
    /// Discover tools, open memory and wire the Ollama-backed collaborators
    pub async fn build(config: &Config) -> Result<Self> {
        let registry = Arc::new(
            ToolRegistry::initialize(&config.endpoints)
                .await
                .context("Failed to initialize tool registry")?,
        );

        let (memory, database) = open_memory(config).await?;

        let generator: Arc<dyn TextGenerator> = Arc::new(
            OllamaGenerator::from_config(config).context("Failed to create Ollama client")?,
        );

        let rules = ScopeRules::new(&config.perception.scope).context("Invalid scope keywords")?;
        let names = registry.tool_names().into_iter().map(str::to_string).collect();
        let perceiver = LlmPerceiver::new(generator.clone(), rules)
            .with_tools(names, registry.describe_tools());
        let decider = LlmDecider::new(generator);

        let agent = CognitiveLoop::new(
            registry.clone(),
            memory.clone(),
            Arc::new(perceiver),
            Arc::new(decider),
            LoopSettings::from_config(config),
        );

        Ok(Self {
            registry,
            memory,
            agent,
            database,
        })
    }

    /// Stop endpoints and checkpoint the memory log
    pub async fn shutdown(self) -> Result<()> {
        self.registry.shutdown().await;
        if let Some(database) = self.database {
            database.close().await?;
        }
        Ok(())
    }
}

async fn open_memory(config: &Config) -> Result<(Arc<MemoryStore>, Option<Database>)> {
    let embedder = embedder_from_config(config).context("Failed to create embedder")?;

    if !config.memory.persist {
        let store = MemoryStore::in_memory(embedder, config.memory.dimension);
        return Ok((Arc::new(store), None));
    }

    let database = Database::new(&config.database_path())
        .await
        .context("Failed to open memory database")?;
    let store = MemoryStore::open(database.memory(), embedder, config.memory.dimension)
        .await
        .context("Failed to load memory store")?;
    Ok((Arc::new(store), Some(database)))
}

/// Cancel `token` on Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            token.cancel();
        }
    });
}

/// Run one session for a query
pub async fn handle_run(query: String, config: &Config, format: OutputFormat) -> Result<()> {
    let runtime = Runtime::build(config).await?;

    if let OutputFormat::Text = format {
        println!("Executing: {}", query);
        println!();
    }

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let outcome = runtime.agent.run(&query, cancel).await;
    print_outcome(&outcome, format)?;

    runtime.shutdown().await?;

    match outcome.status {
        SessionStatus::Completed => Ok(()),
        status => Err(anyhow::anyhow!("Session ended with status '{}'", status)),
    }
}

fn print_outcome(outcome: &SessionOutcome, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("Result:");
            println!("{}", outcome.answer);
            println!();
            let mark = if outcome.status == SessionStatus::Completed {
                "✓"
            } else {
                "✗"
            };
            println!("{} Session {}", mark, outcome.status);
            println!("  Session: {}", outcome.session_id);
            println!("  Steps: {}", outcome.steps);
            println!("  Tool calls: {}", outcome.history.len());
            for step in &outcome.history {
                println!("    {}", step.summary());
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(outcome)?);
        }
    }
    Ok(())
}

/// List discovered tools grouped by endpoint
pub async fn handle_tools(config: &Config, format: OutputFormat) -> Result<()> {
    let registry = ToolRegistry::initialize(&config.endpoints)
        .await
        .context("Failed to initialize tool registry")?;

    match format {
        OutputFormat::Text => {
            let endpoints = registry.endpoints();
            if endpoints.is_empty() {
                println!("No endpoints reachable.");
            }
            for (id, kind) in endpoints {
                println!("{} ({})", id, kind);
                for spec in registry.specs() {
                    if registry.endpoint_of(&spec.name) == Some(id) {
                        println!("  {:<24} {}", spec.name, spec.description);
                    }
                }
            }
        }
        OutputFormat::Json => {
            let tools: Vec<_> = registry
                .specs()
                .into_iter()
                .map(|spec| {
                    json!({
                        "name": spec.name,
                        "description": spec.description,
                        "endpoint": registry.endpoint_of(&spec.name),
                        "input_schema": spec.input_schema,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&tools)?);
        }
    }

    registry.shutdown().await;
    Ok(())
}

/// Nearest memory records to `text`
pub async fn handle_memory_search(
    text: String,
    k: usize,
    kind: Option<String>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let (memory, database) = open_memory(config).await?;

    let mut query = MemoryQuery::new(&text, k);
    if let Some(kind) = kind {
        let kind = RecordKind::parse(&kind)
            .ok_or_else(|| anyhow::anyhow!("Unknown record kind '{}'", kind))?;
        query = query.kind(kind);
    }

    let hits = memory.query_with(&query).await?;

    match format {
        OutputFormat::Text => {
            if hits.is_empty() {
                println!("No matching records.");
            }
            for hit in &hits {
                println!(
                    "{:.4}  [{}] {}  {}",
                    hit.distance,
                    hit.record.kind,
                    hit.record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    hit.record.text
                );
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&hits)?);
        }
    }

    if let Some(database) = database {
        database.close().await?;
    }
    Ok(())
}

/// Options for `listen`
#[derive(Debug, Clone)]
pub struct ListenOptions {
    pub poll_tool: String,
    pub reply_tool: Option<String>,
    pub interval: Duration,
}

/// Poll for messages and answer each with one session until Ctrl-C
pub async fn handle_listen(options: ListenOptions, config: &Config, format: OutputFormat) -> Result<()> {
    let runtime = Runtime::build(config).await?;

    for tool in std::iter::once(&options.poll_tool).chain(options.reply_tool.as_ref()) {
        if !runtime.registry.contains(tool) {
            runtime.shutdown().await?;
            return Err(anyhow::anyhow!("Tool '{}' is not exposed by any endpoint", tool));
        }
    }

    let shutdown = CancellationToken::new();
    cancel_on_ctrl_c(shutdown.clone());

    let mut source = ToolPollSource::new(runtime.registry.clone(), &options.poll_tool, options.interval);
    info!(tool = %options.poll_tool, interval_ms = options.interval.as_millis() as u64, "Listening for messages");
    if let OutputFormat::Text = format {
        println!("Listening on '{}'. Press Ctrl-C to stop.", options.poll_tool);
    }

    while let Some(message) = source.next_message(&shutdown).await {
        info!(message_id = ?message.message_id, chat_id = ?message.chat_id, "Message received");

        let outcome = runtime.agent.run(&message.text, shutdown.child_token()).await;
        print_outcome(&outcome, format)?;

        if let Some(reply_tool) = &options.reply_tool {
            match message.reply_arguments(&outcome.answer) {
                Some(arguments) => {
                    let sent = runtime
                        .registry
                        .dispatch(&ToolCall::new(reply_tool.as_str(), arguments))
                        .await;
                    if !sent.result.success {
                        warn!(tool = %reply_tool, error = %sent.result.text(), "Failed to send reply");
                    }
                }
                None => warn!("Message has no chat id, reply skipped"),
            }
        }
    }

    info!("Listener stopped");
    runtime.shutdown().await
}
