//! CLI interface for Conduit
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Conduit agent engine
///
/// Runs a perceive, retrieve, decide, act loop over tools served by local
/// subprocess endpoints and remote HTTP endpoints.
#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one session for a query
    Run {
        /// The request to solve
        query: String,
    },

    /// List tools discovered on the configured endpoints
    Tools,

    /// Inspect the memory store
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Poll a message tool and run a session per new message
    Listen {
        /// Tool returning `{message, chat_id, message_id}`
        #[arg(long, value_name = "TOOL")]
        poll_tool: String,

        /// Tool taking `{input: {chat_id, text}}` to send answers back
        #[arg(long, value_name = "TOOL")]
        reply_tool: Option<String>,

        /// Seconds between polls
        #[arg(long, default_value = "5")]
        interval_secs: u64,
    },
}

/// Memory actions
#[derive(Subcommand, Debug)]
pub enum MemoryAction {
    /// Nearest records to a text
    Search {
        /// Text to search for
        text: String,

        /// Number of results
        #[arg(short, long, default_value = "5")]
        k: usize,

        /// Only records of this kind (perception, tool_output, final_answer)
        #[arg(long)]
        kind: Option<String>,
    },
}
