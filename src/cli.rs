use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Conversation router - webhook ingestion and bot dispatch
#[derive(Debug, Parser)]
#[command(name = "conversation-router", version, about)]
pub struct Cli {
    /// Path to the YAML config file
    #[arg(short, long, env = "CONFIG_PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the HTTP server, ingest workers and retry reaper (default)
    Serve,
    /// Apply the database schema and exit
    Migrate,
    /// Run one retry pass over unprocessed webhook events and exit
    Replay,
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Serve)
    }
}
