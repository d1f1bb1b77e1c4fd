// Conduit Agent Engine
// Main entry point for the conduit binary

use clap::Parser;
use conduit_engine::cli::{Cli, Command, MemoryAction};
use conduit_engine::config::Config;
use conduit_engine::handlers::{
    handle_listen, handle_memory_search, handle_run, handle_tools, ListenOptions, OutputFormat,
};
use conduit_engine::telemetry::init_telemetry_with_level;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the config; RUST_LOG wins over both
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(level);

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::info!("Conduit v{} ({} - {})", version, commit, timestamp);

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Handle commands
    match cli.command {
        Command::Run { query } => handle_run(query, &config, format).await,

        Command::Tools => handle_tools(&config, format).await,

        Command::Memory { action } => match action {
            MemoryAction::Search { text, k, kind } => {
                handle_memory_search(text, k, kind, &config, format).await
            }
        },

        Command::Listen {
            poll_tool,
            reply_tool,
            interval_secs,
        } => {
            let options = ListenOptions {
                poll_tool,
                reply_tool,
                interval: Duration::from_secs(interval_secs.max(1)),
            };
            handle_listen(options, &config, format).await
        }
    }
}
